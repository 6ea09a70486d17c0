/// In-memory indexing structures for fast lookups
///
/// Four indexes, all rebuilt from segments plus the write log on start:
/// - Concept Index: ConceptId → storage location, O(1) lookups
/// - Adjacency Index: ConceptId → neighbors, both directions per edge
/// - Inverted Index: normalized word → set of ConceptIds
/// - Temporal Index: timestamp (µs) → ConceptIds, point and range queries
///
/// Reads are lock-free on the sharded maps; the temporal index takes a
/// short lock for its ordered map.
use crate::types::{AssociationRecord, AssociationType, ConceptId, Neighbor};
use crate::write_log::EdgeSide;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Location of a concept's durable record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConceptLocation {
    /// Still only in the write log / read snapshot
    Memory,
    /// Sealed into a segment
    Segment { segment_id: u32, offset: u64 },
}

/// Complete indexing system
pub struct GraphIndex {
    /// Concept ID → storage location
    concept_index: DashMap<ConceptId, ConceptLocation>,

    /// Concept ID → neighbors; SmallVec keeps the common case (≤8
    /// neighbors) off the heap
    adjacency_index: DashMap<ConceptId, SmallVec<[Neighbor; 8]>>,

    /// Normalized word → concept ids containing it
    inverted_index: DashMap<String, HashSet<ConceptId>>,

    /// Creation timestamp (µs) → concept ids
    temporal_index: Arc<RwLock<BTreeMap<u64, Vec<ConceptId>>>>,

    total_concepts: AtomicU64,
    total_edges: AtomicU64,
}

/// Split content into normalized index tokens: Unicode case-folded,
/// split on non-alphanumeric boundaries, tokens shorter than 2
/// characters dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(|token| token.to_lowercase())
        .collect()
}

impl GraphIndex {
    pub fn new() -> Self {
        Self {
            concept_index: DashMap::new(),
            adjacency_index: DashMap::new(),
            inverted_index: DashMap::new(),
            temporal_index: Arc::new(RwLock::new(BTreeMap::new())),
            total_concepts: AtomicU64::new(0),
            total_edges: AtomicU64::new(0),
        }
    }

    /// Insert or relocate a concept
    pub fn insert_concept(&self, id: ConceptId, location: ConceptLocation, created: u64) {
        let fresh = self.concept_index.insert(id, location).is_none();

        if fresh {
            let mut temporal = self.temporal_index.write();
            temporal.entry(created).or_default().push(id);
            drop(temporal);
            self.total_concepts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn lookup_concept(&self, id: ConceptId) -> Option<ConceptLocation> {
        self.concept_index.get(&id).map(|v| *v.value())
    }

    pub fn contains(&self, id: ConceptId) -> bool {
        self.concept_index.contains_key(&id)
    }

    /// Remove a concept from the live indexes. Temporal and inverted
    /// entries are kept; tombstoned ids simply stop resolving.
    pub fn remove_concept(&self, id: ConceptId) {
        if self.concept_index.remove(&id).is_some() {
            self.total_concepts.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some((_, neighbors)) = self.adjacency_index.remove(&id) {
            self.total_edges
                .fetch_sub(neighbors.len() as u64, Ordering::Relaxed);
        }
    }

    /// Install one direction of an edge; a duplicate (endpoint, type)
    /// entry is replaced (strength and timestamp coalesce).
    fn upsert_direction(&self, from: ConceptId, neighbor: Neighbor) -> bool {
        let mut entry = self.adjacency_index.entry(from).or_default();
        if let Some(existing) = entry
            .iter_mut()
            .find(|n| n.id == neighbor.id && n.assoc_type == neighbor.assoc_type)
        {
            *existing = neighbor;
            false
        } else {
            entry.push(neighbor);
            true
        }
    }

    /// Add an association to the adjacency index. Both directions are
    /// written for the same record so neighbor queries see the edge from
    /// either endpoint.
    pub fn add_edge(&self, record: &AssociationRecord, side: EdgeSide) {
        let assoc_type = match record.association_type() {
            Some(t) => t,
            None => return,
        };
        let (source, target, strength, created) = (
            record.source_id,
            record.target_id,
            record.strength,
            record.created,
        );

        let mut added = false;
        if matches!(side, EdgeSide::Both | EdgeSide::Forward) {
            added |= self.upsert_direction(
                source,
                Neighbor {
                    id: target,
                    assoc_type,
                    strength,
                    created,
                },
            );
        }
        if matches!(side, EdgeSide::Both | EdgeSide::Inverse) {
            added |= self.upsert_direction(
                target,
                Neighbor {
                    id: source,
                    assoc_type,
                    strength,
                    created,
                },
            );
        }
        if added {
            self.total_edges.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop an association from the adjacency index
    pub fn remove_edge(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        side: EdgeSide,
    ) {
        let mut removed = false;
        if matches!(side, EdgeSide::Both | EdgeSide::Forward) {
            if let Some(mut entry) = self.adjacency_index.get_mut(&source) {
                let before = entry.len();
                entry.retain(|n| !(n.id == target && n.assoc_type == assoc_type));
                removed |= entry.len() < before;
            }
        }
        if matches!(side, EdgeSide::Both | EdgeSide::Inverse) {
            if let Some(mut entry) = self.adjacency_index.get_mut(&target) {
                let before = entry.len();
                entry.retain(|n| !(n.id == source && n.assoc_type == assoc_type));
                removed |= entry.len() < before;
            }
        }
        if removed {
            self.total_edges.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Neighbors of a concept, optionally filtered by association type
    pub fn neighbors(&self, id: ConceptId, filter: Option<AssociationType>) -> Vec<Neighbor> {
        self.adjacency_index
            .get(&id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|n| filter.map(|t| n.assoc_type == t).unwrap_or(true))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Index a concept's content words
    pub fn index_content(&self, id: ConceptId, content: &[u8]) {
        let text = String::from_utf8_lossy(content);
        for word in tokenize(&text) {
            self.inverted_index.entry(word).or_default().insert(id);
        }
    }

    /// Search for concepts containing one word
    pub fn search_by_word(&self, word: &str) -> Vec<ConceptId> {
        let normalized = word.to_lowercase();
        self.inverted_index
            .get(&normalized)
            .map(|set| set.value().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Multi-word search: intersection of per-word sets
    pub fn search_by_words(&self, words: &[String]) -> Vec<ConceptId> {
        if words.is_empty() {
            return Vec::new();
        }

        let mut sets: Vec<HashSet<ConceptId>> = Vec::with_capacity(words.len());
        for word in words {
            let normalized = word.to_lowercase();
            match self.inverted_index.get(&normalized) {
                Some(set) => sets.push(set.value().clone()),
                // A word with no postings empties the intersection.
                None => return Vec::new(),
            }
        }

        let mut result = sets.remove(0);
        for set in sets {
            result.retain(|id| set.contains(id));
        }

        let mut ids: Vec<_> = result.into_iter().collect();
        ids.sort_unstable();
        ids
    }

    /// Concepts created at exactly this timestamp (µs)
    pub fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId> {
        let temporal = self.temporal_index.read();
        temporal.get(&timestamp).cloned().unwrap_or_default()
    }

    /// Concepts created in the half-open range [start, end)
    pub fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId> {
        let temporal = self.temporal_index.read();
        temporal
            .range(start..end)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let temporal = self.temporal_index.read();
        IndexStats {
            total_concepts: self.total_concepts.load(Ordering::Relaxed),
            total_edges: self.total_edges.load(Ordering::Relaxed),
            total_words: self.inverted_index.len() as u64,
            total_timestamps: temporal.len() as u64,
        }
    }

    pub fn clear(&self) {
        self.concept_index.clear();
        self.adjacency_index.clear();
        self.inverted_index.clear();
        self.temporal_index.write().clear();
        self.total_concepts.store(0, Ordering::Relaxed);
        self.total_edges.store(0, Ordering::Relaxed);
    }
}

impl Default for GraphIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Index statistics
#[derive(Debug, Clone, Copy)]
pub struct IndexStats {
    pub total_concepts: u64,
    pub total_edges: u64,
    pub total_words: u64,
    pub total_timestamps: u64,
}
