/// Persistent HNSW approximate nearest-neighbour index
///
/// Wraps a USearch index with mmap-based persistence so startup loads
/// the graph in milliseconds instead of rebuilding it. The index file
/// (`hnsw.idx`) is paired with a small metadata sidecar holding the
/// key ↔ ConceptId mappings and the tombstone set.
///
/// Semantics:
/// - insert is idempotent per id; the last insert wins
/// - remove tombstones; the graph keeps the node, search filters it
/// - ties on distance break by ascending id
use crate::error::{EngineError, Result};
use crate::types::ConceptId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Vector dimension
    pub dimension: usize,
    /// Graph degree at upper layers (M)
    pub max_neighbors: usize,
    /// Candidate pool while inserting (efConstruction)
    pub ef_construction: usize,
    /// Candidate pool per query (efSearch); adjustable after build
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            max_neighbors: 16,
            ef_construction: 200,
            ef_search: 100,
        }
    }
}

/// Sidecar metadata persisted next to the index file
#[derive(Serialize, Deserialize)]
struct HnswMetadata {
    version: u32,
    id_map: HashMap<u64, ConceptId>,
    next_key: u64,
    tombstones: HashSet<ConceptId>,
}

/// HNSW index with persistence
pub struct HnswIndex {
    /// Path of the index snapshot (`hnsw.idx`)
    path: PathBuf,
    index: RwLock<Option<Index>>,
    id_map: RwLock<HashMap<u64, ConceptId>>,
    reverse_map: RwLock<HashMap<ConceptId, u64>>,
    tombstones: RwLock<HashSet<ConceptId>>,
    next_key: RwLock<u64>,
    dirty: RwLock<bool>,
    config: HnswConfig,
}

impl HnswIndex {
    pub fn new<P: AsRef<Path>>(path: P, config: HnswConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            index: RwLock::new(None),
            id_map: RwLock::new(HashMap::new()),
            reverse_map: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashSet::new()),
            next_key: RwLock::new(0),
            dirty: RwLock::new(false),
            config,
        }
    }

    fn make_index(&self) -> Result<Index> {
        Index::new(&IndexOptions {
            dimensions: self.config.dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.config.max_neighbors,
            expansion_add: self.config.ef_construction,
            expansion_search: self.config.ef_search,
            multi: false,
        })
        .map_err(|e| EngineError::FatalIo(format!("HNSW index create: {}", e)))
    }

    fn meta_path(&self) -> PathBuf {
        self.path.with_extension("idx.meta")
    }

    /// Load a persisted snapshot if present, otherwise start empty.
    pub fn load_or_create(&self) -> Result<()> {
        let index = self.make_index()?;

        if self.path.exists() && self.meta_path().exists() {
            index
                .load(self.path.to_str().unwrap_or_default())
                .map_err(|e| EngineError::CorruptState(format!("HNSW load: {}", e)))?;

            let bytes = std::fs::read(self.meta_path())?;
            let metadata: HnswMetadata = bincode::deserialize(&bytes)
                .map_err(|e| EngineError::CorruptState(format!("HNSW metadata: {}", e)))?;

            let mut reverse = self.reverse_map.write();
            reverse.clear();
            for (key, id) in metadata.id_map.iter() {
                reverse.insert(*id, *key);
            }
            drop(reverse);

            *self.id_map.write() = metadata.id_map;
            *self.tombstones.write() = metadata.tombstones;
            *self.next_key.write() = metadata.next_key;

            log::info!(
                "loaded HNSW snapshot with {} vectors from {:?}",
                index.size(),
                self.path
            );
        }

        *self.index.write() = Some(index);
        Ok(())
    }

    /// Insert a vector. Duplicate id replaces the previous vector
    /// (last-insert wins) and clears any tombstone.
    pub fn insert(&self, id: ConceptId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(EngineError::Validation(format!(
                "HNSW vector dimension mismatch: expected {}, got {}",
                self.config.dimension,
                vector.len()
            )));
        }

        let index_lock = self.index.read();
        let index = index_lock
            .as_ref()
            .ok_or_else(|| EngineError::FatalIo("HNSW index not initialized".into()))?;

        // Last-insert wins: drop the old graph entry for this id.
        if let Some(&old_key) = self.reverse_map.read().get(&id) {
            index
                .remove(old_key)
                .map_err(|e| EngineError::FatalIo(format!("HNSW remove: {}", e)))?;
            self.id_map.write().remove(&old_key);
        }

        let key = {
            let mut next = self.next_key.write();
            let key = *next;
            *next += 1;
            key
        };

        // Grow capacity geometrically; per-insert reserve would make
        // bulk loads quadratic.
        if index.size() + 1 > index.capacity() {
            let target = ((index.size() + 1).next_power_of_two()).max(1024);
            index
                .reserve(target)
                .map_err(|e| EngineError::FatalIo(format!("HNSW reserve: {}", e)))?;
        }
        index
            .add(key, vector)
            .map_err(|e| EngineError::FatalIo(format!("HNSW add: {}", e)))?;

        self.id_map.write().insert(key, id);
        self.reverse_map.write().insert(id, key);
        self.tombstones.write().remove(&id);
        *self.dirty.write() = true;

        Ok(())
    }

    /// Tombstone an id; the graph keeps the node, searches filter it.
    pub fn remove(&self, id: ConceptId) {
        if self.reverse_map.read().contains_key(&id) {
            self.tombstones.write().insert(id);
            *self.dirty.write() = true;
        }
    }

    /// k-NN search returning up to k (id, cosine distance) pairs sorted
    /// by distance ascending, ties by ascending id.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(ConceptId, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let index_lock = self.index.read();
        let index = match index_lock.as_ref() {
            Some(index) => index,
            None => return Vec::new(),
        };

        // Over-fetch so tombstoned entries cannot crowd out live ones.
        let tombstoned = self.tombstones.read().len();
        let fetch = (k + tombstoned).min(index.size().max(1));

        let matches = match index.search(query, fetch) {
            Ok(m) => m,
            Err(e) => {
                log::error!("HNSW search failed: {}", e);
                return Vec::new();
            }
        };

        let id_map = self.id_map.read();
        let tombstones = self.tombstones.read();
        let mut results: Vec<(ConceptId, f32)> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                id_map.get(key).and_then(|id| {
                    if tombstones.contains(id) {
                        None
                    } else {
                        Some((*id, *distance))
                    }
                })
            })
            .collect();

        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        results.truncate(k);
        results
    }

    /// Adjust the per-query candidate pool. The only HNSW parameter
    /// that may change after construction.
    pub fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        let index_lock = self.index.read();
        if let Some(index) = index_lock.as_ref() {
            index.change_expansion_search(ef_search);
        }
        Ok(())
    }

    /// Persist the graph and metadata sidecar
    pub fn save(&self) -> Result<()> {
        if !*self.dirty.read() {
            return Ok(());
        }

        let index_lock = self.index.read();
        let index = index_lock
            .as_ref()
            .ok_or_else(|| EngineError::FatalIo("HNSW index not initialized".into()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        index
            .save(self.path.to_str().unwrap_or_default())
            .map_err(|e| EngineError::FatalIo(format!("HNSW save: {}", e)))?;

        let metadata = HnswMetadata {
            version: crate::STORAGE_VERSION,
            id_map: self.id_map.read().clone(),
            next_key: *self.next_key.read(),
            tombstones: self.tombstones.read().clone(),
        };
        let bytes = bincode::serialize(&metadata)
            .map_err(|e| EngineError::FatalIo(format!("HNSW metadata serialize: {}", e)))?;
        std::fs::write(self.meta_path(), bytes)?;

        *self.dirty.write() = false;
        Ok(())
    }

    pub fn contains(&self, id: ConceptId) -> bool {
        self.reverse_map.read().contains_key(&id) && !self.tombstones.read().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.reverse_map.read().len() - self.tombstones.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HnswStats {
        let index_lock = self.index.read();
        HnswStats {
            indexed_vectors: index_lock.as_ref().map(|i| i.size()).unwrap_or(0),
            tombstoned: self.tombstones.read().len(),
            dimension: self.config.dimension,
            max_neighbors: self.config.max_neighbors,
            dirty: *self.dirty.read(),
            initialized: index_lock.is_some(),
        }
    }
}

/// HNSW statistics
#[derive(Debug, Clone)]
pub struct HnswStats {
    pub indexed_vectors: usize,
    pub tombstoned: usize,
    pub dimension: usize,
    pub max_neighbors: usize,
    pub dirty: bool,
    pub initialized: bool,
}
