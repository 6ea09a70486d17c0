/// Manifest file for the segment catalog
///
/// A JSON file tracking segments per level, the active WAL file, the
/// last reconciled sequence and the vector-store/HNSW descriptors.
/// Updated atomically: write to a temp file, fsync, rename.
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Metadata about one sealed segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub segment_id: u32,
    /// File name relative to the segments directory
    pub path: PathBuf,
    pub level: u32,
    pub concept_count: u32,
    pub association_count: u32,
    pub file_size: u64,
    pub min_key: [u8; 16],
    pub max_key: [u8; 16],
    pub created_at: u64,
}

/// Persistent descriptor of the vector store and its quantizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDescriptor {
    pub dimension: usize,
    pub num_subvectors: usize,
    pub num_centroids: usize,
    pub quantizer_trained: bool,
}

/// Manifest: the authoritative catalog of durable state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub next_segment_id: u32,
    pub segments: Vec<SegmentMetadata>,
    /// Id of the WAL file currently receiving appends
    pub active_wal_file: u64,
    /// Highest WAL sequence folded into the read snapshot and captured
    /// in a segment
    pub last_reconciled_sequence: u64,
    pub vector_descriptor: Option<VectorDescriptor>,
    /// HNSW snapshot file name, if one has been persisted
    pub hnsw_file: Option<PathBuf>,
    pub last_compaction: u64,
    pub compaction_count: u64,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: crate::STORAGE_VERSION,
            next_segment_id: 0,
            segments: Vec::new(),
            active_wal_file: 0,
            last_reconciled_sequence: 0,
            vector_descriptor: None,
            hnsw_file: None,
            last_compaction: 0,
            compaction_count: 0,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let manifest: Manifest = serde_json::from_reader(reader)
            .map_err(|e| EngineError::CorruptState(format!("manifest parse: {}", e)))?;
        if manifest.version != crate::STORAGE_VERSION {
            return Err(EngineError::CorruptState(format!(
                "unsupported manifest version: {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Save atomically: temp file, fsync, rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| EngineError::FatalIo(format!("manifest temp create: {}", e)))?;

            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)
                .map_err(|e| EngineError::FatalIo(format!("manifest serialize: {}", e)))?;
            writer
                .flush()
                .map_err(|e| EngineError::FatalIo(format!("manifest flush: {}", e)))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| EngineError::FatalIo(format!("manifest fsync: {}", e)))?;
        }

        std::fs::rename(&temp_path, path)
            .map_err(|e| EngineError::FatalIo(format!("manifest rename: {}", e)))?;

        Ok(())
    }

    pub fn allocate_segment_id(&mut self) -> u32 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    pub fn add_segment(&mut self, metadata: SegmentMetadata) {
        self.segments.push(metadata);
        self.sort_segments();
    }

    pub fn remove_segments(&mut self, segment_ids: &[u32]) {
        self.segments
            .retain(|s| !segment_ids.contains(&s.segment_id));
    }

    pub fn segments_at_level(&self, level: u32) -> Vec<&SegmentMetadata> {
        self.segments.iter().filter(|s| s.level == level).collect()
    }

    /// Deepest level currently holding segments
    pub fn max_level(&self) -> u32 {
        self.segments.iter().map(|s| s.level).max().unwrap_or(0)
    }

    pub fn total_concepts(&self) -> u64 {
        self.segments.iter().map(|s| s.concept_count as u64).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.file_size).sum()
    }

    /// Sort by level ascending, then newest first within a level
    fn sort_segments(&mut self) {
        self.segments.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.segment_id.cmp(&a.segment_id))
        });
    }

    pub fn record_compaction(&mut self) {
        self.last_compaction = current_timestamp_us();
        self.compaction_count += 1;
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}
