/// Immutable read view for zero-contention queries
///
/// Readers obtain a reference to the current snapshot with a single
/// atomic load and keep it for as long as they like; mutations never
/// touch an installed snapshot. The reconciler builds each successor
/// snapshot with structural sharing (im::HashMap) and installs it with
/// an atomic pointer swap.
use crate::semantic::SemanticMetadata;
use crate::types::{AssociationRecord, ConceptId};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Key identifying one directed typed association
pub type EdgeKey = (ConceptId, ConceptId, u8);

/// In-memory concept with payloads shared across snapshots
#[derive(Debug, Clone)]
pub struct ConceptNode {
    pub id: ConceptId,
    pub content: Arc<[u8]>,
    pub vector: Option<Arc<[f32]>>,
    pub strength: f32,
    pub confidence: f32,
    pub created: u64,
    pub modified: u64,
    pub access_count: u32,
    pub semantic: Option<SemanticMetadata>,
}

impl ConceptNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
        created: u64,
        modified: u64,
    ) -> Self {
        Self {
            id,
            content: Arc::from(content),
            vector: vector.map(Arc::from),
            strength,
            confidence,
            created,
            modified,
            access_count: 0,
            semantic,
        }
    }
}

/// Immutable graph snapshot
///
/// Truly immutable once installed; im::HashMap gives structural sharing
/// between consecutive snapshots so a reconcile cycle only pays for
/// what changed.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// Live concepts by id
    pub concepts: im::HashMap<ConceptId, ConceptNode>,
    /// Live association records (forward key), the durable edge set
    pub associations: im::HashMap<EdgeKey, AssociationRecord>,
    /// Deleted concept ids with deletion timestamps; carried until
    /// compaction drops the underlying records
    pub concept_tombstones: im::HashMap<ConceptId, u64>,
    /// Deleted association keys with deletion timestamps
    pub association_tombstones: im::HashMap<EdgeKey, u64>,

    /// Highest WAL sequence folded into this snapshot
    pub sequence: u64,
    pub timestamp: u64,
}

impl GraphSnapshot {
    pub fn new(sequence: u64) -> Self {
        Self {
            concepts: im::HashMap::new(),
            associations: im::HashMap::new(),
            concept_tombstones: im::HashMap::new(),
            association_tombstones: im::HashMap::new(),
            sequence,
            timestamp: current_timestamp_us(),
        }
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.concepts.get(id).cloned()
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.concepts.contains_key(id)
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    pub fn edge_count(&self) -> usize {
        self.associations.len()
    }
}

/// Read view with atomic snapshot swapping
pub struct ReadView {
    snapshot: ArcSwap<GraphSnapshot>,
}

impl ReadView {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GraphSnapshot::new(0)),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Load the current snapshot (lock-free)
    pub fn load(&self) -> Arc<GraphSnapshot> {
        self.snapshot.load_full()
    }

    /// Install a new snapshot (atomic swap). Sequences only move
    /// forward; an out-of-order install is a logic error upstream and
    /// is refused.
    pub fn store(&self, new_snapshot: GraphSnapshot) {
        let current = self.snapshot.load();
        if new_snapshot.sequence < current.sequence {
            log::error!(
                "refusing snapshot regression: {} < {}",
                new_snapshot.sequence,
                current.sequence
            );
            return;
        }
        self.snapshot.store(Arc::new(new_snapshot));
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.load().get_concept(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.load().contains(id)
    }

    /// (sequence, timestamp, concepts, edges)
    pub fn snapshot_info(&self) -> (u64, u64, usize, usize) {
        let snap = self.load();
        (
            snap.sequence,
            snap.timestamp,
            snap.concept_count(),
            snap.edge_count(),
        )
    }
}

impl Default for ReadView {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8, content: &[u8]) -> ConceptNode {
        ConceptNode::new(
            ConceptId([n; 16]),
            content.to_vec(),
            None,
            1.0,
            0.9,
            None,
            1000,
            1000,
        )
    }

    #[test]
    fn test_snapshot_basic() {
        let mut snapshot = GraphSnapshot::new(0);
        let id = ConceptId([1; 16]);

        snapshot.concepts.insert(id, node(1, &[1, 2, 3]));

        assert!(snapshot.contains(&id));
        assert_eq!(snapshot.get_concept(&id).unwrap().content.as_ref(), &[1, 2, 3]);
        assert_eq!(snapshot.concept_count(), 1);
    }

    #[test]
    fn test_atomic_swap_isolates_readers() {
        let view = ReadView::new();

        let old = view.load();
        assert_eq!(old.sequence, 0);

        let mut next = GraphSnapshot::new(1);
        let id = ConceptId([1; 16]);
        next.concepts.insert(id, node(1, &[42]));
        view.store(next);

        // New readers see the new snapshot; the old reference is stable.
        assert!(view.load().contains(&id));
        assert!(!old.contains(&id));
    }

    #[test]
    fn test_sequence_regression_refused() {
        let view = ReadView::new();
        view.store(GraphSnapshot::new(5));

        view.store(GraphSnapshot::new(3));
        assert_eq!(view.load().sequence, 5);

        // Equal sequence reinstalls are allowed (idempotent reconcile).
        view.store(GraphSnapshot::new(5));
        assert_eq!(view.load().sequence, 5);
    }

    #[test]
    fn test_structural_sharing_is_cheap_to_extend() {
        let mut snapshot = GraphSnapshot::new(0);
        for i in 0..100u8 {
            snapshot.concepts.insert(ConceptId([i; 16]), node(i, &[i]));
        }

        // The clone shares structure; inserting into it leaves the
        // original untouched.
        let mut next = snapshot.clone();
        next.concepts
            .insert(ConceptId([200; 16]), node(200, &[200]));

        assert_eq!(snapshot.concept_count(), 100);
        assert_eq!(next.concept_count(), 101);
    }
}
