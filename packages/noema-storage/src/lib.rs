/// Noema Storage - Concurrent Vector-and-Graph Storage Engine
///
/// A custom storage engine for content-addressed concepts, typed
/// associations and dense embeddings. Not a database.
///
/// Key Features:
/// - Write-ahead logging with per-record checksums
/// - Log-structured segments with memory-mapped zero-copy reads
/// - Lock-free concurrent reads over immutable snapshots
/// - Native vector storage with product quantization
/// - Persistent HNSW approximate nearest-neighbour index
/// - Hash-based sharding with two-phase cross-shard writes

mod config;
mod engine;
mod error;
mod hnsw;
mod index;
mod lsm;
mod manifest;
mod memory;
mod quantization;
mod read_view;
mod reconciler;
mod segment;
mod semantic;
mod sharded;
mod transaction;
mod types;
mod vectors;
mod wal;
mod write_log;

pub mod server;

pub use config::{EngineConfig, FsyncPolicy};
pub use engine::{Engine, EngineStats, LearnOptions, Storage};
pub use error::{EngineError, Result};
pub use hnsw::{HnswConfig, HnswIndex, HnswStats};
pub use index::{ConceptLocation, GraphIndex, IndexStats};
pub use lsm::{CompactionConfig, LsmStats, LsmTree};
pub use manifest::{Manifest, SegmentMetadata, VectorDescriptor};
pub use memory::{ConcurrentMemory, ConcurrentStats};
pub use quantization::{DistanceTable, ProductQuantizer};
pub use read_view::{ConceptNode, GraphSnapshot, ReadView};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerStats};
pub use segment::{Segment, SegmentBuilder, SegmentHeader, SegmentStats};
pub use semantic::{
    CausalKind, CausalRelation, DomainTag, NegationKind, NegationScope, SemanticMetadata,
    SemanticTag, TemporalBounds, TemporalKind,
};
pub use sharded::ShardedStorage;
pub use transaction::{TransactionCoordinator, TxnDecision, TxnState};
pub use types::{
    AssociationId, AssociationRecord, AssociationType, ConceptId, ConceptRecord, Neighbor,
};
pub use vectors::{VectorConfig, VectorStats, VectorStore};
pub use wal::{FrameStats, WalOp, WalRecord, WriteAheadLog};
pub use write_log::{EdgeSide, WriteEntry, WriteLog, WriteLogStats};

/// Version of the on-disk storage format
pub const STORAGE_VERSION: u32 = 1;

/// Maximum content size accepted for a single concept (10 MiB)
pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024;

/// Hard upper bound on vector dimension
pub const MAX_VECTOR_DIMENSION: usize = 2048;

/// Hard cap on associations accepted in a single request
pub const MAX_ASSOCIATIONS_PER_REQUEST: usize = 256;
