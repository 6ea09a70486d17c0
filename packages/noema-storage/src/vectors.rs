/// Dense vector storage with optional product-quantized compression
///
/// Raw float32 vectors keyed by concept id, re-normalised to unit L2 on
/// insert. Compressed codes may co-exist with raw vectors once the
/// quantizer is trained. Persists to three files under `vectors/`:
/// `raw.bin`, `codes.bin` and `codebooks.bin` (little-endian,
/// length-prefixed).
use crate::error::{EngineError, Result};
use crate::quantization::ProductQuantizer;
use crate::types::ConceptId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Vector storage configuration
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// Vector dimensionality, fixed at construction
    pub dimension: usize,
    /// Number of subvectors for product quantization
    pub num_subvectors: usize,
    /// Number of centroids per subvector
    pub num_centroids: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            num_subvectors: 48,
            num_centroids: 256,
        }
    }
}

/// Vector storage with optional compression
pub struct VectorStore {
    config: VectorConfig,
    path: PathBuf,
    /// Raw unit vectors (concept_id -> vector)
    raw: RwLock<HashMap<ConceptId, Vec<f32>>>,
    /// Frozen quantizer once trained; retraining takes this exclusive lock
    quantizer: RwLock<Option<ProductQuantizer>>,
    /// Compressed codes (concept_id -> M bytes)
    codes: RwLock<HashMap<ConceptId, Vec<u8>>>,
}

impl VectorStore {
    pub fn new<P: AsRef<Path>>(path: P, config: VectorConfig) -> Result<Self> {
        if config.dimension == 0 || config.dimension > crate::MAX_VECTOR_DIMENSION {
            return Err(EngineError::Validation(format!(
                "vector dimension {} out of range (1..={})",
                config.dimension,
                crate::MAX_VECTOR_DIMENSION
            )));
        }
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        Ok(Self {
            config,
            path,
            raw: RwLock::new(HashMap::new()),
            quantizer: RwLock::new(None),
            codes: RwLock::new(HashMap::new()),
        })
    }

    /// Open a store, loading any persisted vectors and codebooks
    pub fn open<P: AsRef<Path>>(path: P, config: VectorConfig) -> Result<Self> {
        let store = Self::new(path, config)?;

        let codebooks_path = store.path.join("codebooks.bin");
        if codebooks_path.exists() {
            let quantizer = ProductQuantizer::load(&codebooks_path)?;
            if quantizer.dimension() != store.config.dimension {
                return Err(EngineError::CorruptState(format!(
                    "codebook dimension {} does not match store dimension {}",
                    quantizer.dimension(),
                    store.config.dimension
                )));
            }
            *store.quantizer.write() = Some(quantizer);
        }

        let raw_path = store.path.join("raw.bin");
        if raw_path.exists() {
            store.load_raw(&raw_path)?;
        }
        let codes_path = store.path.join("codes.bin");
        if codes_path.exists() {
            store.load_codes(&codes_path)?;
        }

        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Insert a vector, re-normalising to unit L2. Rejects any
    /// dimension other than the store's.
    pub fn insert(&self, id: ConceptId, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(EngineError::Validation(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.config.dimension,
                vector.len()
            )));
        }

        normalize(&mut vector);

        // Encode under the read lock if the quantizer is trained.
        if let Some(quantizer) = self.quantizer.read().as_ref() {
            let codes = quantizer.encode(&vector)?;
            self.codes.write().insert(id, codes);
        }

        self.raw.write().insert(id, vector);
        Ok(())
    }

    pub fn get(&self, id: ConceptId) -> Option<Vec<f32>> {
        self.raw.read().get(&id).cloned()
    }

    pub fn get_codes(&self, id: ConceptId) -> Option<Vec<u8>> {
        self.codes.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ConceptId) -> bool {
        self.raw.read().contains_key(&id)
    }

    pub fn remove(&self, id: ConceptId) {
        self.raw.write().remove(&id);
        self.codes.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.raw.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.read().is_empty()
    }

    /// Train the product quantizer on the stored vectors (or a supplied
    /// sample). A first call builds the codebooks; later calls go
    /// through `retrain`, which invalidates every previous code, so
    /// encoding is redone under the same exclusive lock.
    pub fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()> {
        let mut quantizer_slot = self.quantizer.write();
        let raw = self.raw.read();

        let collected: Vec<Vec<f32>>;
        let vectors: &[Vec<f32>] = match sample {
            Some(vectors) => vectors,
            None => {
                collected = raw.values().cloned().collect();
                &collected
            }
        };

        match quantizer_slot.take() {
            Some(mut quantizer) => {
                if let Err(e) = quantizer.retrain(vectors) {
                    // Retraining already discarded the old codebooks;
                    // stale codes must not outlive them.
                    self.codes.write().clear();
                    return Err(e);
                }
                *quantizer_slot = Some(quantizer);
            }
            None => {
                let mut quantizer = ProductQuantizer::new(
                    self.config.dimension,
                    self.config.num_subvectors,
                    self.config.num_centroids,
                )?;
                quantizer.train(vectors)?;
                *quantizer_slot = Some(quantizer);
            }
        }

        if let Some(quantizer) = quantizer_slot.as_ref() {
            let mut codes = self.codes.write();
            codes.clear();
            for (id, vector) in raw.iter() {
                codes.insert(*id, quantizer.encode(vector)?);
            }
        }

        Ok(())
    }

    pub fn quantizer_trained(&self) -> bool {
        self.quantizer.read().is_some()
    }

    /// Exact cosine distance between two stored vectors
    pub fn distance(&self, id1: ConceptId, id2: ConceptId) -> Result<f32> {
        let raw = self.raw.read();
        let v1 = raw
            .get(&id1)
            .ok_or_else(|| EngineError::NotFound(format!("vector {}", id1)))?;
        let v2 = raw
            .get(&id2)
            .ok_or_else(|| EngineError::NotFound(format!("vector {}", id2)))?;
        Ok(cosine_distance(v1, v2))
    }

    /// Exact k-NN by linear scan over raw vectors. Used as the fallback
    /// search path; ties break on ascending id.
    pub fn linear_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        if query.len() != self.config.dimension {
            return Err(EngineError::Validation(format!(
                "query dimension mismatch: expected {}, got {}",
                self.config.dimension,
                query.len()
            )));
        }
        let mut normalized = query.to_vec();
        normalize(&mut normalized);

        let raw = self.raw.read();
        let mut results: Vec<(ConceptId, f32)> = raw
            .iter()
            .map(|(id, vector)| (*id, cosine_distance(&normalized, vector)))
            .collect();
        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    /// Approximate k-NN over compressed codes using a per-query lookup
    /// table (asymmetric distance computation)
    pub fn approximate_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        let quantizer = self.quantizer.read();
        let quantizer = quantizer
            .as_ref()
            .ok_or_else(|| EngineError::Validation("quantizer not trained".into()))?;

        let mut normalized = query.to_vec();
        normalize(&mut normalized);
        let table = quantizer.distance_table(&normalized)?;

        let codes = self.codes.read();
        let mut results: Vec<(ConceptId, f32)> = codes
            .iter()
            .map(|(id, code)| (*id, table.distance(code)))
            .collect();
        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    /// Persist raw vectors, codes and codebooks
    pub fn save(&self) -> Result<()> {
        let raw_path = self.path.join("raw.bin");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&raw_path)?;
            let mut writer = BufWriter::new(file);
            let raw = self.raw.read();
            writer.write_all(&(raw.len() as u32).to_le_bytes())?;
            for (id, vector) in raw.iter() {
                writer.write_all(&id.0)?;
                writer.write_all(&(vector.len() as u32).to_le_bytes())?;
                for &value in vector {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        let codes_path = self.path.join("codes.bin");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&codes_path)?;
            let mut writer = BufWriter::new(file);
            let codes = self.codes.read();
            writer.write_all(&(codes.len() as u32).to_le_bytes())?;
            for (id, code) in codes.iter() {
                writer.write_all(&id.0)?;
                writer.write_all(&(code.len() as u32).to_le_bytes())?;
                writer.write_all(code)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        if let Some(quantizer) = self.quantizer.read().as_ref() {
            quantizer.save(self.path.join("codebooks.bin"))?;
        }

        Ok(())
    }

    fn load_raw(&self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut count_bytes = [0u8; 4];
        reader.read_exact(&mut count_bytes)?;
        let count = u32::from_le_bytes(count_bytes);

        let mut raw = self.raw.write();
        for _ in 0..count {
            let mut id_bytes = [0u8; 16];
            reader.read_exact(&mut id_bytes)?;

            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len != self.config.dimension {
                return Err(EngineError::CorruptState(format!(
                    "stored vector dimension {} does not match store dimension {}",
                    len, self.config.dimension
                )));
            }

            let mut buf = vec![0u8; len * 4];
            reader.read_exact(&mut buf)?;
            let vector: Vec<f32> = buf
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
                .collect();

            raw.insert(ConceptId(id_bytes), vector);
        }
        Ok(())
    }

    fn load_codes(&self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut count_bytes = [0u8; 4];
        reader.read_exact(&mut count_bytes)?;
        let count = u32::from_le_bytes(count_bytes);

        let mut codes = self.codes.write();
        for _ in 0..count {
            let mut id_bytes = [0u8; 16];
            reader.read_exact(&mut id_bytes)?;

            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;

            let mut code = vec![0u8; len];
            reader.read_exact(&mut code)?;
            codes.insert(ConceptId(id_bytes), code);
        }
        Ok(())
    }

    pub fn stats(&self) -> VectorStats {
        let raw = self.raw.read();
        let codes = self.codes.read();

        let raw_size = raw.values().map(|v| v.len() * 4).sum::<usize>();
        let compressed_size = codes.values().map(|c| c.len()).sum::<usize>();

        VectorStats {
            total_vectors: raw.len(),
            compressed_vectors: codes.len(),
            dimension: self.config.dimension,
            raw_size_bytes: raw_size,
            compressed_size_bytes: compressed_size,
            quantizer_trained: self.quantizer.read().is_some(),
        }
    }
}

/// Vector statistics
#[derive(Debug, Clone)]
pub struct VectorStats {
    pub total_vectors: usize,
    pub compressed_vectors: usize,
    pub dimension: usize,
    pub raw_size_bytes: usize,
    pub compressed_size_bytes: usize,
    pub quantizer_trained: bool,
}

/// Re-normalise to unit L2 in place; the zero vector stays untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine distance in [0, 2]; zero-norm inputs are maximally distant.
pub fn cosine_distance(v1: &[f32], v2: &[f32]) -> f32 {
    let dot: f32 = v1.iter().zip(v2.iter()).map(|(a, b)| a * b).sum();
    let norm1: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm2: f32 = v2.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm1 == 0.0 || norm2 == 0.0 {
        return 1.0;
    }

    1.0 - (dot / (norm1 * norm2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_id(n: u64) -> ConceptId {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&n.to_le_bytes());
        ConceptId(bytes)
    }

    fn sample(dim: usize, seed: usize) -> Vec<f32> {
        (0..dim)
            .map(|j| ((seed * 31 + j * 7) % 23) as f32 * 0.07 + 0.01)
            .collect()
    }

    fn small_config(dim: usize) -> VectorConfig {
        VectorConfig {
            dimension: dim,
            num_subvectors: 8,
            num_centroids: 16,
        }
    }

    #[test]
    fn test_dimension_enforced() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(64)).unwrap();

        assert!(store.insert(test_id(1), vec![0.5; 64]).is_ok());
        assert!(matches!(
            store.insert(test_id(2), vec![0.5; 63]),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            store.insert(test_id(3), vec![0.5; 65]),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_oversized_dimension_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        let config = VectorConfig {
            dimension: crate::MAX_VECTOR_DIMENSION + 1,
            ..Default::default()
        };
        assert!(matches!(
            VectorStore::new(dir.path(), config),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_normalisation_on_insert() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(4)).unwrap();

        store.insert(test_id(1), vec![3.0, 0.0, 0.0, 4.0]).unwrap();
        let stored = store.get(test_id(1)).unwrap();
        let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((stored[0] - 0.6).abs() < 1e-6);
        assert!((stored[3] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_linear_search_orders_by_distance() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(4)).unwrap();

        store.insert(test_id(1), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        store.insert(test_id(2), vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        store.insert(test_id(3), vec![0.9, 0.1, 0.0, 0.0]).unwrap();

        let results = store.linear_search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, test_id(1));
        assert!(results[0].1 < 1e-6);
        assert_eq!(results[1].0, test_id(3));
    }

    #[test]
    fn test_train_and_approximate_search() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(64)).unwrap();

        for i in 0..40u64 {
            store.insert(test_id(i), sample(64, i as usize)).unwrap();
        }

        store.train_quantizer(None).unwrap();
        assert!(store.quantizer_trained());

        let stats = store.stats();
        assert_eq!(stats.total_vectors, 40);
        assert_eq!(stats.compressed_vectors, 40);
        assert!(stats.compressed_size_bytes < stats.raw_size_bytes);

        // New inserts are encoded immediately.
        store.insert(test_id(100), sample(64, 100)).unwrap();
        assert!(store.get_codes(test_id(100)).is_some());

        let query = sample(64, 3);
        let approx = store.approximate_search(&query, 5).unwrap();
        assert_eq!(approx.len(), 5);
        assert_eq!(approx[0].0, test_id(3));
    }

    #[test]
    fn test_retrain_reencodes_everything() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(64)).unwrap();

        for i in 0..40u64 {
            store.insert(test_id(i), sample(64, i as usize)).unwrap();
        }
        store.train_quantizer(None).unwrap();
        let before = store.get_codes(test_id(3)).unwrap();

        // Second call retrains the existing quantizer on a different
        // sample; every code is rebuilt against the new codebooks.
        let shifted: Vec<Vec<f32>> = (100..140).map(|i| sample(64, i)).collect();
        store.train_quantizer(Some(&shifted)).unwrap();

        assert!(store.quantizer_trained());
        let after = store.get_codes(test_id(3)).unwrap();
        assert_eq!(after.len(), before.len());
        let stats = store.stats();
        assert_eq!(stats.compressed_vectors, stats.total_vectors);

        // A failed retrain leaves neither codebooks nor stale codes.
        let too_few = vec![sample(64, 1); 4];
        assert!(matches!(
            store.train_quantizer(Some(&too_few)),
            Err(EngineError::Validation(_))
        ));
        assert!(!store.quantizer_trained());
        assert!(store.get_codes(test_id(3)).is_none());
    }

    #[test]
    fn test_training_needs_enough_vectors() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(64)).unwrap();

        for i in 0..10u64 {
            store.insert(test_id(i), sample(64, i as usize)).unwrap();
        }
        // 10 < K+1 = 17
        assert!(matches!(
            store.train_quantizer(None),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_save_open_round_trip() {
        let dir = TempDir::new().unwrap();

        {
            let store = VectorStore::new(dir.path(), small_config(64)).unwrap();
            for i in 0..30u64 {
                store.insert(test_id(i), sample(64, i as usize)).unwrap();
            }
            store.train_quantizer(None).unwrap();
            store.save().unwrap();
        }

        let store = VectorStore::open(dir.path(), small_config(64)).unwrap();
        assert_eq!(store.len(), 30);
        assert!(store.quantizer_trained());
        assert!(store.get(test_id(5)).is_some());
        assert!(store.get_codes(test_id(5)).is_some());

        // Raw and compressed co-exist and agree on membership.
        let stats = store.stats();
        assert_eq!(stats.total_vectors, stats.compressed_vectors);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(dir.path(), small_config(4)).unwrap();

        store.insert(test_id(1), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(store.contains(test_id(1)));
        store.remove(test_id(1));
        assert!(!store.contains(test_id(1)));
    }

    #[test]
    fn test_cosine_distance_extremes() {
        let v1 = vec![1.0, 0.0];
        let v2 = vec![1.0, 0.0];
        let v3 = vec![-1.0, 0.0];

        assert!(cosine_distance(&v1, &v2).abs() < 1e-6);
        assert!((cosine_distance(&v1, &v3) - 2.0).abs() < 1e-6);
    }
}
