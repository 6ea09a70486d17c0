/// Engine façade
///
/// One explicit handle assembling the storage core and exposing the
/// learn/query/search/traverse operations. All inputs are validated
/// here before any state change; malformed requests fail without side
/// effects. The backend is either a single shard (`ConcurrentMemory`)
/// or N shards behind the router (`ShardedStorage`).
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::memory::ConcurrentMemory;
use crate::read_view::ConceptNode;
use crate::semantic::{DomainTag, SemanticMetadata, SemanticTag};
use crate::sharded::ShardedStorage;
use crate::types::{AssociationType, ConceptId, Neighbor};
use crate::write_log::EdgeSide;
use std::sync::Arc;

/// Options accompanying a learn request. The embedding / association /
/// semantic flags instruct the external pipeline, not the engine; the
/// engine validates and carries them.
#[derive(Debug, Clone)]
pub struct LearnOptions {
    /// Ask the pipeline to request an embedding for this content
    pub generate_embedding: bool,
    /// Ask the pipeline to extract associations
    pub extract_associations: bool,
    /// Ask the pipeline to run semantic classification
    pub analyze_semantics: bool,
    /// Associations below this confidence are discarded upstream
    pub min_association_confidence: f32,
    /// Pipeline-level cap on associations per concept
    pub max_associations_per_concept: usize,
    pub strength: f32,
    pub confidence: f32,
}

impl Default for LearnOptions {
    fn default() -> Self {
        Self {
            generate_embedding: true,
            extract_associations: true,
            analyze_semantics: true,
            min_association_confidence: 0.5,
            max_associations_per_concept: 10,
            strength: 1.0,
            confidence: 1.0,
        }
    }
}

impl LearnOptions {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_association_confidence) {
            return Err(EngineError::Validation(format!(
                "min_association_confidence {} outside [0, 1]",
                self.min_association_confidence
            )));
        }
        if self.max_associations_per_concept > crate::MAX_ASSOCIATIONS_PER_REQUEST {
            return Err(EngineError::Validation(format!(
                "max_associations_per_concept {} exceeds hard cap {}",
                self.max_associations_per_concept,
                crate::MAX_ASSOCIATIONS_PER_REQUEST
            )));
        }
        validate_unit_interval("strength", self.strength)?;
        validate_unit_interval("confidence", self.confidence)?;
        Ok(())
    }
}

fn validate_unit_interval(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Validation(format!(
            "{} {} outside [0, 1]",
            name, value
        )));
    }
    Ok(())
}

/// Engine-level statistics
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct EngineStats {
    pub concepts: usize,
    pub edges: usize,
    pub vectors: usize,
    pub wal_appends: u64,
    pub wal_dropped: u64,
    pub reconciliations: u64,
    pub uptime_secs: u64,
}

/// The capability set shared by both storage backends
pub trait Storage: Send + Sync {
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
    ) -> Result<u64>;

    fn add_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64>;

    fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode>;
    fn get_neighbors(&self, id: ConceptId, filter: Option<AssociationType>) -> Vec<Neighbor>;
    fn search_by_words(&self, words: &[String]) -> Vec<ConceptId>;
    fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId>;
    fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId>;
    fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>>;
    fn find_path(&self, start: ConceptId, end: ConceptId, max_depth: usize)
        -> Option<Vec<ConceptId>>;

    fn remove_concept(&self, id: ConceptId) -> Result<u64>;
    fn remove_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Result<u64>;
    fn reinforce(&self, id: ConceptId, strength: f32) -> Result<u64>;
    fn record_access(&self, id: ConceptId);

    fn semantic_concepts(&self) -> Vec<(ConceptId, SemanticMetadata)>;
    fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()>;
    fn set_ef_search(&self, ef_search: usize) -> Result<()>;
    fn checkpoint(&self) -> Result<()>;
    fn reconcile_now(&self);
    fn engine_stats(&self) -> EngineStats;
}

impl Storage for ConcurrentMemory {
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
    ) -> Result<u64> {
        ConcurrentMemory::learn_concept(self, id, content, vector, strength, confidence, semantic)
    }

    fn add_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64> {
        self.learn_association(source, target, assoc_type, strength, EdgeSide::Both)
    }

    fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        ConcurrentMemory::get_concept(self, id)
    }

    fn get_neighbors(&self, id: ConceptId, filter: Option<AssociationType>) -> Vec<Neighbor> {
        ConcurrentMemory::get_neighbors(self, id, filter)
    }

    fn search_by_words(&self, words: &[String]) -> Vec<ConceptId> {
        ConcurrentMemory::search_by_words(self, words)
    }

    fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId> {
        ConcurrentMemory::query_at_time(self, timestamp)
    }

    fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId> {
        ConcurrentMemory::query_time_range(self, start, end)
    }

    fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        ConcurrentMemory::vector_search(self, query, k)
    }

    fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        ConcurrentMemory::find_path(self, start, end, max_depth)
    }

    fn remove_concept(&self, id: ConceptId) -> Result<u64> {
        ConcurrentMemory::remove_concept(self, id)
    }

    fn remove_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Result<u64> {
        ConcurrentMemory::remove_association(self, source, target, assoc_type)
    }

    fn reinforce(&self, id: ConceptId, strength: f32) -> Result<u64> {
        ConcurrentMemory::reinforce(self, id, strength)
    }

    fn record_access(&self, id: ConceptId) {
        ConcurrentMemory::record_access(self, id)
    }

    fn semantic_concepts(&self) -> Vec<(ConceptId, SemanticMetadata)> {
        ConcurrentMemory::semantic_concepts(self)
    }

    fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()> {
        ConcurrentMemory::train_quantizer(self, sample)
    }

    fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        ConcurrentMemory::set_ef_search(self, ef_search)
    }

    fn checkpoint(&self) -> Result<()> {
        ConcurrentMemory::checkpoint(self)
    }

    fn reconcile_now(&self) {
        ConcurrentMemory::reconcile_now(self);
    }

    fn engine_stats(&self) -> EngineStats {
        let stats = self.stats();
        EngineStats {
            concepts: stats.concepts,
            edges: stats.edges,
            vectors: stats.vectors,
            wal_appends: stats.wal_appends,
            wal_dropped: stats.wal_rejected,
            reconciliations: stats.reconciliations,
            uptime_secs: stats.uptime_secs,
        }
    }
}

impl Storage for ShardedStorage {
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
    ) -> Result<u64> {
        ShardedStorage::learn_concept(self, id, content, vector, strength, confidence, semantic)
    }

    fn add_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64> {
        ShardedStorage::add_association(self, source, target, assoc_type, strength)
    }

    fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        ShardedStorage::get_concept(self, id)
    }

    fn get_neighbors(&self, id: ConceptId, filter: Option<AssociationType>) -> Vec<Neighbor> {
        ShardedStorage::get_neighbors(self, id, filter)
    }

    fn search_by_words(&self, words: &[String]) -> Vec<ConceptId> {
        ShardedStorage::search_by_words(self, words)
    }

    fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId> {
        ShardedStorage::query_at_time(self, timestamp)
    }

    fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId> {
        ShardedStorage::query_time_range(self, start, end)
    }

    fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        ShardedStorage::vector_search(self, query, k)
    }

    fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        ShardedStorage::find_path(self, start, end, max_depth)
    }

    fn remove_concept(&self, id: ConceptId) -> Result<u64> {
        ShardedStorage::remove_concept(self, id)
    }

    fn remove_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Result<u64> {
        ShardedStorage::remove_association(self, source, target, assoc_type)
    }

    fn reinforce(&self, id: ConceptId, strength: f32) -> Result<u64> {
        ShardedStorage::reinforce(self, id, strength)
    }

    fn record_access(&self, id: ConceptId) {
        ShardedStorage::record_access(self, id)
    }

    fn semantic_concepts(&self) -> Vec<(ConceptId, SemanticMetadata)> {
        ShardedStorage::semantic_concepts(self)
    }

    fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()> {
        ShardedStorage::train_quantizer(self, sample)
    }

    fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        ShardedStorage::set_ef_search(self, ef_search)
    }

    fn checkpoint(&self) -> Result<()> {
        ShardedStorage::checkpoint(self)
    }

    fn reconcile_now(&self) {
        ShardedStorage::reconcile_now(self);
    }

    fn engine_stats(&self) -> EngineStats {
        let shard_stats = self.shard_stats();
        EngineStats {
            concepts: shard_stats.iter().map(|s| s.concepts).sum(),
            edges: shard_stats.iter().map(|s| s.edges).sum(),
            vectors: shard_stats.iter().map(|s| s.vectors).sum(),
            wal_appends: shard_stats.iter().map(|s| s.wal_appends).sum(),
            wal_dropped: shard_stats.iter().map(|s| s.wal_rejected).sum(),
            reconciliations: shard_stats.iter().map(|s| s.reconciliations).sum(),
            uptime_secs: shard_stats.iter().map(|s| s.uptime_secs).max().unwrap_or(0),
        }
    }
}

/// The engine handle. Construct once, share by reference; background
/// tasks belong to it and stop at teardown.
pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn Storage>,
}

impl Engine {
    /// Open the engine at the configured storage root. A single-shard
    /// configuration runs one `ConcurrentMemory` directly; more shards
    /// compose through the router and coordinator.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn Storage> = if config.num_shards == 1 {
            Arc::new(ConcurrentMemory::open(config.clone())?)
        } else {
            Arc::new(ShardedStorage::open(config.clone())?)
        };

        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn validate_content(&self, content: &[u8]) -> Result<()> {
        if content.is_empty() {
            return Err(EngineError::Validation("content must not be empty".into()));
        }
        if content.len() > crate::MAX_CONTENT_SIZE {
            return Err(EngineError::Validation(format!(
                "content of {} bytes exceeds the {} byte limit",
                content.len(),
                crate::MAX_CONTENT_SIZE
            )));
        }
        Ok(())
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.vector_dimension {
            return Err(EngineError::Validation(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.config.vector_dimension,
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::Validation(
                "vector contains a non-finite component".into(),
            ));
        }
        Ok(())
    }

    /// Store a concept. The id is the content hash, so learning the
    /// same bytes twice yields the same id and a whole-record
    /// replacement (last-writer-wins).
    pub fn learn(
        &self,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        semantic: Option<SemanticMetadata>,
        options: &LearnOptions,
    ) -> Result<ConceptId> {
        self.validate_content(&content)?;
        options.validate()?;
        if let Some(ref v) = vector {
            self.validate_vector(v)?;
        }

        let id = ConceptId::from_content(&content);
        self.backend.learn_concept(
            id,
            content,
            vector,
            options.strength,
            options.confidence,
            semantic,
        )?;
        Ok(id)
    }

    /// Store a directed typed association. Neither endpoint has to
    /// exist yet; ingest may deliver edges before their concepts.
    pub fn add_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64> {
        validate_unit_interval("strength", strength)?;
        self.backend
            .add_association(source, target, assoc_type, strength)
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        let node = self.backend.get_concept(id);
        if node.is_some() {
            self.backend.record_access(*id);
        }
        node
    }

    pub fn get_neighbours(
        &self,
        id: ConceptId,
        filter: Option<AssociationType>,
    ) -> Vec<Neighbor> {
        self.backend.get_neighbors(id, filter)
    }

    pub fn search_by_word(&self, tokens: &[String]) -> Vec<ConceptId> {
        self.backend.search_by_words(tokens)
    }

    pub fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId> {
        self.backend.query_at_time(timestamp)
    }

    pub fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId> {
        self.backend.query_time_range(start, end)
    }

    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        self.validate_vector(query)?;
        self.backend.vector_search(query, k)
    }

    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        self.backend.find_path(start, end, max_depth)
    }

    pub fn remove_concept(&self, id: ConceptId) -> Result<()> {
        self.backend.remove_concept(id)?;
        Ok(())
    }

    pub fn remove_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Result<()> {
        self.backend.remove_association(source, target, assoc_type)?;
        Ok(())
    }

    pub fn reinforce(&self, id: ConceptId, strength: f32) -> Result<()> {
        validate_unit_interval("strength", strength)?;
        self.backend.reinforce(id, strength)?;
        Ok(())
    }

    /// Post-hoc contradiction detection over semantic metadata: pairs
    /// of stored concepts whose blocks conflict (explicit contradiction
    /// negations, or same-domain rules with overlapping temporal
    /// bounds). Contradictions are reported, never blocked at write.
    pub fn find_contradictions(&self, domain: Option<DomainTag>) -> Vec<(ConceptId, ConceptId)> {
        let candidates: Vec<(ConceptId, SemanticMetadata)> = self
            .backend
            .semantic_concepts()
            .into_iter()
            .filter(|(_, semantic)| {
                domain.map(|d| semantic.domain == Some(d)).unwrap_or(true)
                    && (semantic.tag == SemanticTag::Rule || semantic.negation_scope.is_some())
            })
            .collect();

        let mut conflicts = Vec::new();
        for (i, (id_a, sem_a)) in candidates.iter().enumerate() {
            for (id_b, sem_b) in candidates.iter().skip(i + 1) {
                if sem_a.conflicts_with(sem_b) || sem_b.conflicts_with(sem_a) {
                    let pair = if id_a < id_b {
                        (*id_a, *id_b)
                    } else {
                        (*id_b, *id_a)
                    };
                    conflicts.push(pair);
                }
            }
        }
        conflicts.sort();
        conflicts.dedup();
        conflicts
    }

    pub fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()> {
        self.backend.train_quantizer(sample)
    }

    /// Adjust the HNSW query candidate pool; the only runtime-tunable
    /// parameter.
    pub fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        if ef_search == 0 {
            return Err(EngineError::Validation("ef_search must be > 0".into()));
        }
        self.backend.set_ef_search(ef_search)
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.backend.checkpoint()
    }

    /// Fold all pending writes into the read snapshot immediately.
    /// Useful in tests and before consistency-sensitive reads.
    pub fn reconcile_now(&self) {
        self.backend.reconcile_now();
    }

    pub fn stats(&self) -> EngineStats {
        self.backend.engine_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &std::path::Path) -> Engine {
        Engine::open(EngineConfig {
            storage_path: dir.to_path_buf(),
            vector_dimension: 4,
            pq_subvectors: 4,
            pq_centroids: 16,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_learn_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());

        let id1 = engine
            .learn(b"same content".to_vec(), None, None, &LearnOptions::default())
            .unwrap();
        let id2 = engine
            .learn(b"same content".to_vec(), None, None, &LearnOptions::default())
            .unwrap();

        assert_eq!(id1, id2);
        engine.reconcile_now();
        assert_eq!(engine.stats().concepts, 1);
    }

    #[test]
    fn test_boundary_validation() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let options = LearnOptions::default();

        // Zero-length content rejected.
        assert!(matches!(
            engine.learn(Vec::new(), None, None, &options),
            Err(EngineError::Validation(_))
        ));

        // 10 MiB accepted, one byte more rejected.
        let at_limit = vec![7u8; crate::MAX_CONTENT_SIZE];
        assert!(engine.learn(at_limit, None, None, &options).is_ok());
        let over_limit = vec![7u8; crate::MAX_CONTENT_SIZE + 1];
        assert!(matches!(
            engine.learn(over_limit, None, None, &options),
            Err(EngineError::Validation(_))
        ));

        // Dimension D accepted, D±1 rejected.
        assert!(engine
            .learn(b"v".to_vec(), Some(vec![0.5; 4]), None, &options)
            .is_ok());
        assert!(matches!(
            engine.learn(b"w".to_vec(), Some(vec![0.5; 3]), None, &options),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.learn(b"x".to_vec(), Some(vec![0.5; 5]), None, &options),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_option_validation() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());

        let mut options = LearnOptions::default();
        options.strength = 1.5;
        assert!(matches!(
            engine.learn(b"y".to_vec(), None, None, &options),
            Err(EngineError::Validation(_))
        ));

        let mut options = LearnOptions::default();
        options.max_associations_per_concept = 257;
        assert!(matches!(
            engine.learn(b"z".to_vec(), None, None, &options),
            Err(EngineError::Validation(_))
        ));

        // The documented default cap is within the hard cap.
        let options = LearnOptions::default();
        assert_eq!(options.max_associations_per_concept, 10);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_failed_write_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());

        let before = engine.stats();
        let _ = engine.learn(Vec::new(), None, None, &LearnOptions::default());
        engine.reconcile_now();
        let after = engine.stats();

        assert_eq!(before.concepts, after.concepts);
        assert_eq!(before.wal_appends, after.wal_appends);
    }

    #[test]
    fn test_association_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let options = LearnOptions::default();

        let x = engine.learn(b"rain".to_vec(), None, None, &options).unwrap();
        let y = engine.learn(b"wet streets".to_vec(), None, None, &options).unwrap();
        engine
            .add_association(x, y, AssociationType::Causal, 0.9)
            .unwrap();
        engine.reconcile_now();

        let neighbors = engine.get_neighbours(x, None);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, y);
        assert_eq!(neighbors[0].assoc_type, AssociationType::Causal);

        // Filtered by type.
        assert!(engine
            .get_neighbours(x, Some(AssociationType::Temporal))
            .is_empty());

        // Duplicate (source, target, type) coalesces to the new strength.
        engine
            .add_association(x, y, AssociationType::Causal, 0.4)
            .unwrap();
        engine.reconcile_now();
        let neighbors = engine.get_neighbours(x, None);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].strength, 0.4);
    }

    #[test]
    fn test_find_contradictions() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let options = LearnOptions::default();

        let mut rule_a = SemanticMetadata::new(SemanticTag::Rule);
        rule_a.domain = Some(DomainTag::Legal);
        rule_a.temporal_bounds = Some(crate::semantic::TemporalBounds::new(
            Some(1000),
            Some(2000),
            crate::semantic::TemporalKind::Interval,
            0.9,
        ));

        let mut rule_b = rule_a.clone();
        rule_b.temporal_bounds = Some(crate::semantic::TemporalBounds::new(
            Some(1500),
            Some(2500),
            crate::semantic::TemporalKind::Interval,
            0.9,
        ));

        let a = engine
            .learn(b"contracts must be signed".to_vec(), None, Some(rule_a), &options)
            .unwrap();
        let b = engine
            .learn(b"contracts need no signature".to_vec(), None, Some(rule_b), &options)
            .unwrap();
        engine.reconcile_now();

        let conflicts = engine.find_contradictions(Some(DomainTag::Legal));
        let expected = if a < b { (a, b) } else { (b, a) };
        assert_eq!(conflicts, vec![expected]);

        assert!(engine
            .find_contradictions(Some(DomainTag::Medical))
            .is_empty());
    }

    #[test]
    fn test_sharded_backend_selected() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(EngineConfig {
            storage_path: dir.path().to_path_buf(),
            num_shards: 2,
            vector_dimension: 4,
            pq_subvectors: 4,
            pq_centroids: 16,
            ..Default::default()
        })
        .unwrap();
        let options = LearnOptions::default();

        for i in 0..20u8 {
            engine
                .learn(format!("concept {}", i).into_bytes(), None, None, &options)
                .unwrap();
        }
        engine.reconcile_now();
        assert_eq!(engine.stats().concepts, 20);
    }
}
