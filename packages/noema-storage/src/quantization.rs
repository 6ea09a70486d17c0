/// Product Quantization for vector compression
///
/// Splits a D-dimensional vector into M equal subvectors and encodes
/// each against a codebook of K centroids trained with Lloyd's
/// algorithm. With the defaults (D=768, M=48, K=256) every vector
/// compresses to 48 bytes, 32× smaller than float32.
///
/// Once trained the codebooks are frozen; retraining invalidates every
/// existing code and callers must re-encode.
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Maximum Lloyd's iterations per subspace
const MAX_KMEANS_ITERATIONS: usize = 25;
/// Stop once no centroid moved further than this
const CONVERGENCE_DELTA: f32 = 1e-4;

/// Product Quantizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    /// Original vector dimension
    dimension: usize,
    /// Number of subvectors
    num_subvectors: usize,
    /// Dimension of each subvector
    subvector_dim: usize,
    /// Number of centroids per subvector
    num_centroids: usize,
    /// Codebooks: [num_subvectors][num_centroids][subvector_dim]
    codebooks: Vec<Vec<Vec<f32>>>,
    /// Frozen after training
    trained: bool,
}

/// Per-query lookup table for asymmetric distance computation: the
/// query-to-centroid distances are computed once (M·K entries) and code
/// distances become M table lookups per candidate.
pub struct DistanceTable {
    num_subvectors: usize,
    num_centroids: usize,
    /// Squared distances, laid out [subvector][centroid]
    table: Vec<f32>,
}

impl DistanceTable {
    /// Approximate squared distance for one encoded vector
    pub fn distance_squared(&self, codes: &[u8]) -> f32 {
        debug_assert_eq!(codes.len(), self.num_subvectors);
        codes
            .iter()
            .enumerate()
            .map(|(m, &code)| self.table[m * self.num_centroids + code as usize])
            .sum()
    }

    /// Approximate Euclidean distance for one encoded vector
    pub fn distance(&self, codes: &[u8]) -> f32 {
        self.distance_squared(codes).sqrt()
    }
}

impl ProductQuantizer {
    pub fn new(dimension: usize, num_subvectors: usize, num_centroids: usize) -> Result<Self> {
        if num_subvectors == 0 || dimension % num_subvectors != 0 {
            return Err(EngineError::Validation(format!(
                "dimension {} must be divisible by num_subvectors {}",
                dimension, num_subvectors
            )));
        }
        if num_centroids == 0 || num_centroids > 256 {
            return Err(EngineError::Validation(format!(
                "num_centroids {} must be in 1..=256 for u8 codes",
                num_centroids
            )));
        }

        let subvector_dim = dimension / num_subvectors;

        Ok(Self {
            dimension,
            num_subvectors,
            subvector_dim,
            num_centroids,
            codebooks: Vec::new(),
            trained: false,
        })
    }

    /// Train codebooks on a sample. Requires at least K+1 vectors so
    /// every centroid is identifiable.
    pub fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if self.trained {
            return Err(EngineError::Validation(
                "quantizer already trained; use retrain to rebuild codebooks".into(),
            ));
        }
        if vectors.len() < self.num_centroids + 1 {
            return Err(EngineError::Validation(format!(
                "training requires at least {} vectors, got {}",
                self.num_centroids + 1,
                vectors.len()
            )));
        }
        for vector in vectors {
            if vector.len() != self.dimension {
                return Err(EngineError::Validation(format!(
                    "training vector dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }

        let mut codebooks = Vec::with_capacity(self.num_subvectors);
        for subvec_idx in 0..self.num_subvectors {
            let start = subvec_idx * self.subvector_dim;
            let end = start + self.subvector_dim;

            let subvectors: Vec<Vec<f32>> =
                vectors.iter().map(|v| v[start..end].to_vec()).collect();

            codebooks.push(kmeans(&subvectors, self.num_centroids));
        }

        self.codebooks = codebooks;
        self.trained = true;
        Ok(())
    }

    /// Discard frozen codebooks and train again. Every previously
    /// produced code is invalid afterwards.
    pub fn retrain(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        self.trained = false;
        self.codebooks = Vec::new();
        self.train(vectors)
    }

    /// Encode a vector to M one-byte codes (deterministic)
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if !self.trained {
            return Err(EngineError::Validation("quantizer not trained".into()));
        }
        if vector.len() != self.dimension {
            return Err(EngineError::Validation(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }

        let mut codes = Vec::with_capacity(self.num_subvectors);
        for subvec_idx in 0..self.num_subvectors {
            let start = subvec_idx * self.subvector_dim;
            let subvector = &vector[start..start + self.subvector_dim];

            let mut best = 0u8;
            let mut best_dist = f32::MAX;
            for (code, centroid) in self.codebooks[subvec_idx].iter().enumerate() {
                let dist = distance_squared(subvector, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = code as u8;
                }
            }
            codes.push(best);
        }

        Ok(codes)
    }

    /// Decode codes back to the approximate vector
    pub fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        if !self.trained {
            return Err(EngineError::Validation("quantizer not trained".into()));
        }
        if codes.len() != self.num_subvectors {
            return Err(EngineError::Validation(format!(
                "code length mismatch: expected {}, got {}",
                self.num_subvectors,
                codes.len()
            )));
        }

        let mut vector = Vec::with_capacity(self.dimension);
        for (subvec_idx, &code) in codes.iter().enumerate() {
            let centroid = self.codebooks[subvec_idx]
                .get(code as usize)
                .ok_or_else(|| EngineError::Validation("code out of range".into()))?;
            vector.extend_from_slice(centroid);
        }

        Ok(vector)
    }

    /// Build the per-query lookup table for asymmetric distances
    pub fn distance_table(&self, query: &[f32]) -> Result<DistanceTable> {
        if !self.trained {
            return Err(EngineError::Validation("quantizer not trained".into()));
        }
        if query.len() != self.dimension {
            return Err(EngineError::Validation(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }

        let mut table = vec![0.0f32; self.num_subvectors * self.num_centroids];
        for subvec_idx in 0..self.num_subvectors {
            let start = subvec_idx * self.subvector_dim;
            let sub_query = &query[start..start + self.subvector_dim];
            for (code, centroid) in self.codebooks[subvec_idx].iter().enumerate() {
                table[subvec_idx * self.num_centroids + code] =
                    distance_squared(sub_query, centroid);
            }
        }

        Ok(DistanceTable {
            num_subvectors: self.num_subvectors,
            num_centroids: self.num_centroids,
            table,
        })
    }

    /// Symmetric distance between two encoded vectors
    pub fn code_distance(&self, codes1: &[u8], codes2: &[u8]) -> Result<f32> {
        if codes1.len() != self.num_subvectors || codes2.len() != self.num_subvectors {
            return Err(EngineError::Validation("code length mismatch".into()));
        }

        let mut total = 0.0;
        for subvec_idx in 0..self.num_subvectors {
            let c1 = &self.codebooks[subvec_idx][codes1[subvec_idx] as usize];
            let c2 = &self.codebooks[subvec_idx][codes2[subvec_idx] as usize];
            total += distance_squared(c1, c2);
        }

        Ok(total.sqrt())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self)
            .map_err(|e| EngineError::FatalIo(format!("quantizer serialize: {}", e)))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let quantizer = bincode::deserialize_from(reader)
            .map_err(|e| EngineError::CorruptState(format!("quantizer deserialize: {}", e)))?;
        Ok(quantizer)
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_subvectors(&self) -> usize {
        self.num_subvectors
    }

    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    pub fn compression_ratio(&self) -> f32 {
        (self.dimension * 4) as f32 / self.num_subvectors as f32
    }
}

/// Lloyd's algorithm with farthest-first (k-means++ style) seeding.
/// Deterministic: the same sample always yields the same codebook.
fn kmeans(vectors: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
    let dim = vectors[0].len();

    // Seeding: first point, then repeatedly the point farthest from its
    // nearest chosen centroid.
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors[0].clone());

    let mut min_dists: Vec<f32> = vectors
        .iter()
        .map(|v| distance_squared(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let (far_idx, _) = min_dists
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .unwrap();
        centroids.push(vectors[far_idx].clone());
        let newest = centroids.last().unwrap();
        for (dist, vector) in min_dists.iter_mut().zip(vectors.iter()) {
            let d = distance_squared(vector, newest);
            if d < *dist {
                *dist = d;
            }
        }
    }

    // Lloyd's iterations, bounded, stopping on centroid delta.
    let mut assignment = vec![0usize; vectors.len()];
    for _ in 0..MAX_KMEANS_ITERATIONS {
        for (slot, vector) in assignment.iter_mut().zip(vectors.iter()) {
            let mut best = 0;
            let mut best_dist = f32::MAX;
            for (idx, centroid) in centroids.iter().enumerate() {
                let dist = distance_squared(vector, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = idx;
                }
            }
            *slot = best;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (vector, &cluster) in vectors.iter().zip(assignment.iter()) {
            counts[cluster] += 1;
            for (s, &v) in sums[cluster].iter_mut().zip(vector.iter()) {
                *s += v;
            }
        }

        let mut max_delta = 0.0f32;
        for (cluster, (sum, &count)) in sums.iter().zip(counts.iter()).enumerate() {
            if count == 0 {
                continue; // empty cluster keeps its centroid
            }
            let new_centroid: Vec<f32> = sum.iter().map(|s| s / count as f32).collect();
            let delta = distance_squared(&centroids[cluster], &new_centroid).sqrt();
            if delta > max_delta {
                max_delta = delta;
            }
            centroids[cluster] = new_centroid;
        }

        if max_delta < CONVERGENCE_DELTA {
            break;
        }
    }

    centroids
}

#[inline]
fn distance_squared(v1: &[f32], v2: &[f32]) -> f32 {
    v1.iter()
        .zip(v2.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_vectors(count: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|i| {
                (0..dim)
                    .map(|j| {
                        let base = ((i * dim + j) % 97) as f32 * 0.013;
                        let variation = ((i + j) % 7) as f32 * 0.11;
                        base + variation
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_construction_validation() {
        assert!(ProductQuantizer::new(768, 48, 256).is_ok());
        assert!(matches!(
            ProductQuantizer::new(768, 47, 256),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            ProductQuantizer::new(768, 48, 512),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_training_requires_enough_vectors() {
        let mut pq = ProductQuantizer::new(64, 8, 16).unwrap();

        let too_few = sample_vectors(16, 64);
        assert!(matches!(
            pq.train(&too_few),
            Err(EngineError::Validation(_))
        ));
        assert!(!pq.is_trained());

        let enough = sample_vectors(17, 64);
        pq.train(&enough).unwrap();
        assert!(pq.is_trained());
    }

    #[test]
    fn test_frozen_after_training() {
        let mut pq = ProductQuantizer::new(64, 8, 16).unwrap();
        let vectors = sample_vectors(64, 64);
        pq.train(&vectors).unwrap();

        assert!(matches!(
            pq.train(&vectors),
            Err(EngineError::Validation(_))
        ));
        // Retrain is the explicit escape hatch.
        pq.retrain(&vectors).unwrap();
        assert!(pq.is_trained());
    }

    #[test]
    fn test_encode_decode_deterministic() {
        let mut pq = ProductQuantizer::new(64, 8, 16).unwrap();
        let vectors = sample_vectors(100, 64);
        pq.train(&vectors).unwrap();

        let codes1 = pq.encode(&vectors[3]).unwrap();
        let codes2 = pq.encode(&vectors[3]).unwrap();
        assert_eq!(codes1, codes2);
        assert_eq!(codes1.len(), 8);

        // decode → re-encode is idempotent
        let decoded = pq.decode(&codes1).unwrap();
        assert_eq!(decoded.len(), 64);
        let recoded = pq.encode(&decoded).unwrap();
        assert_eq!(codes1, recoded);
    }

    #[test]
    fn test_reconstruction_error_bounded() {
        let mut pq = ProductQuantizer::new(64, 8, 32).unwrap();
        let vectors = sample_vectors(300, 64);
        pq.train(&vectors).unwrap();

        let mut total_mse = 0.0f32;
        for vector in vectors.iter().take(50) {
            let decoded = pq.decode(&pq.encode(vector).unwrap()).unwrap();
            let mse: f32 = vector
                .iter()
                .zip(decoded.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                / vector.len() as f32;
            total_mse += mse;
        }
        let mean_mse = total_mse / 50.0;
        assert!(mean_mse.is_finite());
        // Codebook granularity bounds the error for this value range.
        assert!(mean_mse < 0.05, "mean MSE too high: {}", mean_mse);
    }

    #[test]
    fn test_distance_table_matches_decoded_distance() {
        let mut pq = ProductQuantizer::new(32, 4, 16).unwrap();
        let vectors = sample_vectors(120, 32);
        pq.train(&vectors).unwrap();

        let query = &vectors[7];
        let table = pq.distance_table(query).unwrap();

        for vector in vectors.iter().take(20) {
            let codes = pq.encode(vector).unwrap();
            let via_table = table.distance(&codes);
            let decoded = pq.decode(&codes).unwrap();
            let direct = distance_squared(query, &decoded).sqrt();
            assert!(
                (via_table - direct).abs() < 1e-3,
                "table {} vs direct {}",
                via_table,
                direct
            );
        }
    }

    #[test]
    fn test_code_distance() {
        let mut pq = ProductQuantizer::new(32, 4, 16).unwrap();
        let vectors = sample_vectors(100, 32);
        pq.train(&vectors).unwrap();

        let c1 = pq.encode(&vectors[0]).unwrap();
        let c2 = pq.encode(&vectors[50]).unwrap();

        assert!(pq.code_distance(&c1, &c1).unwrap() < 1e-6);
        assert!(pq.code_distance(&c1, &c2).unwrap() >= 0.0);
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("codebooks.bin");

        let mut pq = ProductQuantizer::new(64, 8, 16).unwrap();
        let vectors = sample_vectors(100, 64);
        pq.train(&vectors).unwrap();
        let codes = pq.encode(&vectors[0]).unwrap();

        pq.save(&path).unwrap();
        let loaded = ProductQuantizer::load(&path).unwrap();

        assert!(loaded.is_trained());
        assert_eq!(loaded.dimension(), 64);
        // Loaded codebooks encode identically.
        assert_eq!(loaded.encode(&vectors[0]).unwrap(), codes);
    }

    #[test]
    fn test_compression_ratio() {
        let pq = ProductQuantizer::new(768, 48, 256).unwrap();
        assert!((pq.compression_ratio() - 32.0).abs() < 0.1);
    }
}
