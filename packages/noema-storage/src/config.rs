/// Engine configuration
///
/// Read once at construction. Nothing here may change afterwards
/// except the HNSW efSearch parameter.
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// WAL durability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncPolicy {
    /// fsync before acknowledging every append
    Always,
    /// fsync on explicit sync points (checkpoint, rotation)
    Batch,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage root; shards live in subdirectories when sharded
    pub storage_path: PathBuf,
    /// Number of shards (N); fixed for the life of the store
    pub num_shards: u32,
    /// Vector dimension (D); fixed for the life of the store
    pub vector_dimension: usize,
    /// Product quantization subvectors (M)
    pub pq_subvectors: usize,
    /// Product quantization centroids per subvector (K)
    pub pq_centroids: usize,
    /// HNSW graph degree (M_graph)
    pub hnsw_max_neighbors: usize,
    /// HNSW construction candidate pool
    pub hnsw_ef_construction: usize,
    /// HNSW query candidate pool; the only mutable parameter
    pub hnsw_ef_search: usize,
    /// Concepts held in memory before a segment flush
    pub memory_threshold: usize,
    /// Segment size ceiling (bytes)
    pub segment_size_limit: u64,
    /// Reconciler interval bounds (milliseconds)
    pub reconciler_min_interval_ms: u64,
    pub reconciler_max_interval_ms: u64,
    /// WAL fsync policy
    pub wal_fsync: FsyncPolicy,
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_limit: u64,
    /// Two-phase commit decision timeout
    pub txn_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            num_shards: 1,
            vector_dimension: 768,
            pq_subvectors: 48,
            pq_centroids: 256,
            hnsw_max_neighbors: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 100,
            memory_threshold: 50_000,
            segment_size_limit: 64 * 1024 * 1024,
            reconciler_min_interval_ms: 10,
            reconciler_max_interval_ms: 5_000,
            wal_fsync: FsyncPolicy::Always,
            wal_rotation_limit: 64 * 1024 * 1024,
            txn_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 {
            return Err(EngineError::Validation("num_shards must be > 0".into()));
        }
        if self.vector_dimension == 0 || self.vector_dimension > crate::MAX_VECTOR_DIMENSION {
            return Err(EngineError::Validation(format!(
                "vector_dimension {} out of range (1..={})",
                self.vector_dimension,
                crate::MAX_VECTOR_DIMENSION
            )));
        }
        if self.pq_subvectors == 0 || self.vector_dimension % self.pq_subvectors != 0 {
            return Err(EngineError::Validation(format!(
                "pq_subvectors {} must divide vector_dimension {}",
                self.pq_subvectors, self.vector_dimension
            )));
        }
        if self.pq_centroids == 0 || self.pq_centroids > 256 {
            return Err(EngineError::Validation(
                "pq_centroids must be in 1..=256".into(),
            ));
        }
        if self.reconciler_min_interval_ms == 0
            || self.reconciler_min_interval_ms > self.reconciler_max_interval_ms
        {
            return Err(EngineError::Validation(format!(
                "reconciler interval bounds invalid: {}..{}",
                self.reconciler_min_interval_ms, self.reconciler_max_interval_ms
            )));
        }
        if self.memory_threshold == 0 {
            return Err(EngineError::Validation(
                "memory_threshold must be > 0".into(),
            ));
        }
        if self.segment_size_limit == 0 || self.wal_rotation_limit == 0 {
            return Err(EngineError::Validation(
                "segment and WAL size limits must be > 0".into(),
            ));
        }
        if self.txn_timeout.is_zero() {
            return Err(EngineError::Validation("txn_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// The same configuration rooted at a shard subdirectory
    pub fn for_shard(&self, shard_id: u32) -> Self {
        let mut config = self.clone();
        config.storage_path = self.storage_path.join(format!("shard_{:04}", shard_id));
        config
    }
}
