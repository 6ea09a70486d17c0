//! TCP storage server using the length-prefixed binary protocol
//!
//! Framing: a 4-byte big-endian length, then a MessagePack payload.
//! Frames above 10 MiB are rejected. Responses either carry the
//! operation's payload or an error code with a message; unknown tags
//! and malformed payloads are rejected, not ignored.

use crate::engine::{Engine, EngineStats, LearnOptions};
use crate::error::EngineError;
use crate::semantic::{DomainTag, SemanticMetadata};
use crate::types::{AssociationType, ConceptId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;

/// Maximum frame size on the wire
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Learn options as they appear on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnOptionsMsg {
    pub generate_embedding: bool,
    pub extract_associations: bool,
    pub analyze_semantics: bool,
    pub min_association_confidence: f32,
    pub max_associations_per_concept: usize,
    pub strength: f32,
    pub confidence: f32,
}

impl Default for LearnOptionsMsg {
    fn default() -> Self {
        let d = LearnOptions::default();
        Self {
            generate_embedding: d.generate_embedding,
            extract_associations: d.extract_associations,
            analyze_semantics: d.analyze_semantics,
            min_association_confidence: d.min_association_confidence,
            max_associations_per_concept: d.max_associations_per_concept,
            strength: d.strength,
            confidence: d.confidence,
        }
    }
}

impl From<LearnOptionsMsg> for LearnOptions {
    fn from(m: LearnOptionsMsg) -> Self {
        LearnOptions {
            generate_embedding: m.generate_embedding,
            extract_associations: m.extract_associations,
            analyze_semantics: m.analyze_semantics,
            min_association_confidence: m.min_association_confidence,
            max_associations_per_concept: m.max_associations_per_concept,
            strength: m.strength,
            confidence: m.confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageRequest {
    LearnConcept {
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        semantic: Option<SemanticMetadata>,
        options: LearnOptionsMsg,
    },
    LearnBatch {
        contents: Vec<Vec<u8>>,
        options: LearnOptionsMsg,
    },
    GetConcept {
        concept_id: String,
    },
    GetNeighbours {
        concept_id: String,
        assoc_type: Option<u8>,
    },
    VectorSearch {
        query: Vec<f32>,
        k: u32,
    },
    AddAssociation {
        source_id: String,
        target_id: String,
        assoc_type: u8,
        strength: f32,
    },
    DeleteConcept {
        concept_id: String,
    },
    DeleteAssociation {
        source_id: String,
        target_id: String,
        assoc_type: u8,
    },
    FindPath {
        start_id: String,
        end_id: String,
        max_depth: u32,
    },
    FindContradictions {
        domain: Option<u8>,
    },
    Checkpoint,
    Stats,
    HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptMsg {
    pub concept_id: String,
    pub content: Vec<u8>,
    pub strength: f32,
    pub confidence: f32,
    pub created: u64,
    pub modified: u64,
    pub has_vector: bool,
    pub semantic: Option<SemanticMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighbourMsg {
    pub concept_id: String,
    pub assoc_type: u8,
    pub strength: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    Capacity,
    FatalIo,
    NotFound,
    TransactionAborted,
    CorruptState,
    Unavailable,
    Protocol,
}

impl From<&EngineError> for ErrorCode {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::Validation(_) => Self::Validation,
            EngineError::Capacity(_) => Self::Capacity,
            EngineError::FatalIo(_) => Self::FatalIo,
            EngineError::NotFound(_) => Self::NotFound,
            EngineError::TransactionAborted(_, _) => Self::TransactionAborted,
            EngineError::CorruptState(_) => Self::CorruptState,
            EngineError::Unavailable(_) => Self::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageResponse {
    ConceptLearned {
        concept_id: String,
    },
    BatchLearned {
        concept_ids: Vec<String>,
    },
    Concept {
        concept: Option<ConceptMsg>,
    },
    Neighbours {
        neighbours: Vec<NeighbourMsg>,
    },
    SearchResults {
        results: Vec<(String, f32)>,
    },
    AssociationAdded {
        sequence: u64,
    },
    Deleted,
    Path {
        path: Option<Vec<String>>,
    },
    Contradictions {
        pairs: Vec<(String, String)>,
    },
    CheckpointDone,
    Stats {
        stats: EngineStats,
    },
    Healthy,
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn error_response(e: EngineError) -> StorageResponse {
    StorageResponse::Error {
        code: ErrorCode::from(&e),
        message: e.to_string(),
    }
}

fn parse_id(hex: &str) -> Result<ConceptId, StorageResponse> {
    ConceptId::from_hex(hex).ok_or_else(|| StorageResponse::Error {
        code: ErrorCode::Validation,
        message: format!("malformed concept id: {}", hex),
    })
}

fn parse_assoc_type(value: u8) -> Result<AssociationType, StorageResponse> {
    AssociationType::from_u8(value).ok_or_else(|| StorageResponse::Error {
        code: ErrorCode::Validation,
        message: format!("unknown association type: {}", value),
    })
}

/// Execute one request against the engine
pub fn handle_request(engine: &Engine, request: StorageRequest) -> StorageResponse {
    match request {
        StorageRequest::LearnConcept {
            content,
            vector,
            semantic,
            options,
        } => match engine.learn(content, vector, semantic, &options.into()) {
            Ok(id) => StorageResponse::ConceptLearned {
                concept_id: id.to_hex(),
            },
            Err(e) => error_response(e),
        },

        StorageRequest::LearnBatch { contents, options } => {
            let options: LearnOptions = options.into();
            let mut concept_ids = Vec::with_capacity(contents.len());
            for content in contents {
                match engine.learn(content, None, None, &options) {
                    Ok(id) => concept_ids.push(id.to_hex()),
                    Err(e) => return error_response(e),
                }
            }
            StorageResponse::BatchLearned { concept_ids }
        }

        StorageRequest::GetConcept { concept_id } => {
            let id = match parse_id(&concept_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let concept = engine.get_concept(&id).map(|node| ConceptMsg {
                concept_id: node.id.to_hex(),
                content: node.content.to_vec(),
                strength: node.strength,
                confidence: node.confidence,
                created: node.created,
                modified: node.modified,
                has_vector: node.vector.is_some(),
                semantic: node.semantic,
            });
            StorageResponse::Concept { concept }
        }

        StorageRequest::GetNeighbours {
            concept_id,
            assoc_type,
        } => {
            let id = match parse_id(&concept_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let filter = match assoc_type {
                Some(value) => match parse_assoc_type(value) {
                    Ok(t) => Some(t),
                    Err(response) => return response,
                },
                None => None,
            };
            let neighbours = engine
                .get_neighbours(id, filter)
                .into_iter()
                .map(|n| NeighbourMsg {
                    concept_id: n.id.to_hex(),
                    assoc_type: n.assoc_type as u8,
                    strength: n.strength,
                })
                .collect();
            StorageResponse::Neighbours { neighbours }
        }

        StorageRequest::VectorSearch { query, k } => {
            match engine.vector_search(&query, k as usize) {
                Ok(results) => StorageResponse::SearchResults {
                    results: results
                        .into_iter()
                        .map(|(id, distance)| (id.to_hex(), distance))
                        .collect(),
                },
                Err(e) => error_response(e),
            }
        }

        StorageRequest::AddAssociation {
            source_id,
            target_id,
            assoc_type,
            strength,
        } => {
            let source = match parse_id(&source_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let target = match parse_id(&target_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let assoc_type = match parse_assoc_type(assoc_type) {
                Ok(t) => t,
                Err(response) => return response,
            };
            match engine.add_association(source, target, assoc_type, strength) {
                Ok(sequence) => StorageResponse::AssociationAdded { sequence },
                Err(e) => error_response(e),
            }
        }

        StorageRequest::DeleteConcept { concept_id } => {
            let id = match parse_id(&concept_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            match engine.remove_concept(id) {
                Ok(()) => StorageResponse::Deleted,
                Err(e) => error_response(e),
            }
        }

        StorageRequest::DeleteAssociation {
            source_id,
            target_id,
            assoc_type,
        } => {
            let source = match parse_id(&source_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let target = match parse_id(&target_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let assoc_type = match parse_assoc_type(assoc_type) {
                Ok(t) => t,
                Err(response) => return response,
            };
            match engine.remove_association(source, target, assoc_type) {
                Ok(()) => StorageResponse::Deleted,
                Err(e) => error_response(e),
            }
        }

        StorageRequest::FindPath {
            start_id,
            end_id,
            max_depth,
        } => {
            let start = match parse_id(&start_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let end = match parse_id(&end_id) {
                Ok(id) => id,
                Err(response) => return response,
            };
            let path = engine
                .find_path(start, end, max_depth.min(20) as usize)
                .map(|ids| ids.into_iter().map(|id| id.to_hex()).collect());
            StorageResponse::Path { path }
        }

        StorageRequest::FindContradictions { domain } => {
            let domain = match domain {
                Some(value) => match DomainTag::from_u8(value) {
                    Some(tag) => Some(tag),
                    None => {
                        return StorageResponse::Error {
                            code: ErrorCode::Validation,
                            message: format!("unknown domain tag: {}", value),
                        }
                    }
                },
                None => None,
            };
            let pairs = engine
                .find_contradictions(domain)
                .into_iter()
                .map(|(a, b)| (a.to_hex(), b.to_hex()))
                .collect();
            StorageResponse::Contradictions { pairs }
        }

        StorageRequest::Checkpoint => match engine.checkpoint() {
            Ok(()) => StorageResponse::CheckpointDone,
            Err(e) => error_response(e),
        },

        StorageRequest::Stats => StorageResponse::Stats {
            stats: engine.stats(),
        },

        StorageRequest::HealthCheck => StorageResponse::Healthy,
    }
}

/// TCP server owning a shared engine handle
pub struct StorageServer {
    engine: Arc<Engine>,
}

impl StorageServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Accept connections until ctrl-c
    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("storage server listening on {}", addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    log::debug!("connection from {}", peer);
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, engine).await {
                            log::debug!("connection {} closed: {}", peer, e);
                        }
                    });
                }
                _ = signal::ctrl_c() => {
                    log::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.engine.checkpoint()?;
        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, engine: Arc<Engine>) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            let response = StorageResponse::Error {
                code: ErrorCode::Protocol,
                message: format!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_SIZE),
            };
            write_frame(&mut stream, &response).await?;
            return Ok(());
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        let response = match rmp_serde::from_slice::<StorageRequest>(&payload) {
            Ok(request) => handle_request(&engine, request),
            Err(e) => StorageResponse::Error {
                code: ErrorCode::Protocol,
                message: format!("malformed request: {}", e),
            },
        };

        write_frame(&mut stream, &response).await?;
    }
}

async fn write_frame(stream: &mut TcpStream, response: &StorageResponse) -> anyhow::Result<()> {
    let payload = rmp_serde::to_vec(response)?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}
