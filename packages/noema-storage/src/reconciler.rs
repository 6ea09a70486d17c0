/// Background reconciler: folds the write log into the read snapshot
///
/// Runs on its own thread per shard with an adaptive interval bounded
/// to [10 ms, 5 s]. Under load (write-log depth above the low-water
/// mark) the interval collapses to the minimum; when idle it backs off
/// toward the maximum. Each cycle drains a batch, builds the successor
/// snapshot with structural sharing, installs it atomically and
/// advances the reconciled-up-to sequence.
use crate::index::{ConceptLocation, GraphIndex};
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::types::{ASSOC_FLAG_FORWARD_ONLY, ASSOC_FLAG_INVERSE_ONLY};
use crate::write_log::{EdgeSide, WriteEntry, WriteLog};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Shortest interval between cycles (milliseconds)
    pub min_interval_ms: u64,
    /// Longest interval between cycles (milliseconds)
    pub max_interval_ms: u64,
    /// Max entries folded per cycle
    pub max_batch_size: usize,
    /// Pending depth above which the interval drops to the minimum
    pub low_water_mark: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 10,
            max_interval_ms: 5_000,
            max_batch_size: 10_000,
            low_water_mark: 1_000,
        }
    }
}

/// Reconciler statistics
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerStats {
    pub reconciliations: u64,
    pub entries_processed: u64,
    pub running: bool,
    pub current_interval_ms: u64,
    pub pending: usize,
    /// Highest WAL sequence visible in the read snapshot
    pub reconciled_sequence: u64,
}

/// Background reconciler
pub struct Reconciler {
    config: ReconcilerConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    index: Arc<GraphIndex>,

    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,

    reconciliations: Arc<AtomicU64>,
    entries_processed: Arc<AtomicU64>,
    current_interval_ms: Arc<AtomicU64>,
    /// Serializes fold cycles between the background thread and
    /// synchronous reconcile_now callers
    fold_lock: Arc<Mutex<()>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        write_log: Arc<WriteLog>,
        read_view: Arc<ReadView>,
        index: Arc<GraphIndex>,
    ) -> Self {
        let current_interval_ms = Arc::new(AtomicU64::new(config.min_interval_ms));
        Self {
            config,
            write_log,
            read_view,
            index,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            reconciliations: Arc::new(AtomicU64::new(0)),
            entries_processed: Arc::new(AtomicU64::new(0)),
            current_interval_ms,
            fold_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let write_log = Arc::clone(&self.write_log);
        let read_view = Arc::clone(&self.read_view);
        let index = Arc::clone(&self.index);
        let running = Arc::clone(&self.running);
        let reconciliations = Arc::clone(&self.reconciliations);
        let entries_processed = Arc::clone(&self.entries_processed);
        let current_interval_ms = Arc::clone(&self.current_interval_ms);
        let fold_lock = Arc::clone(&self.fold_lock);

        let handle = thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let processed = reconcile_cycle(
                    &write_log,
                    &read_view,
                    &index,
                    &fold_lock,
                    config.max_batch_size,
                );
                if processed > 0 {
                    reconciliations.fetch_add(1, Ordering::Relaxed);
                    entries_processed.fetch_add(processed as u64, Ordering::Relaxed);
                }

                // Adaptive pacing: collapse under load, back off when idle.
                let pending = write_log.pending();
                let interval = current_interval_ms.load(Ordering::Relaxed);
                let next = if pending > config.low_water_mark {
                    config.min_interval_ms
                } else if processed == 0 {
                    (interval.saturating_mul(2)).min(config.max_interval_ms)
                } else {
                    (interval / 2).max(config.min_interval_ms)
                };
                current_interval_ms.store(next, Ordering::Relaxed);

                thread::sleep(Duration::from_millis(next));
            }
        });

        self.thread_handle = Some(handle);
        log::info!(
            "reconciler started (interval {}..{} ms)",
            self.config.min_interval_ms,
            self.config.max_interval_ms
        );
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            handle.join().ok();
        }
    }

    /// Fold everything currently in the write log, synchronously.
    /// Errors never propagate out of a cycle; a failed fold is retried
    /// on the next one.
    pub fn reconcile_now(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = reconcile_cycle(
                &self.write_log,
                &self.read_view,
                &self.index,
                &self.fold_lock,
                self.config.max_batch_size,
            );
            if processed == 0 {
                break;
            }
            total += processed;
            self.reconciliations.fetch_add(1, Ordering::Relaxed);
            self.entries_processed
                .fetch_add(processed as u64, Ordering::Relaxed);
        }
        total
    }

    /// Highest WAL sequence visible to readers
    pub fn reconciled_sequence(&self) -> u64 {
        self.read_view.load().sequence
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            entries_processed: self.entries_processed.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            current_interval_ms: self.current_interval_ms.load(Ordering::Relaxed),
            pending: self.write_log.pending(),
            reconciled_sequence: self.reconciled_sequence(),
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One fold cycle: drain a batch, build the successor snapshot, install
/// it. Returns the number of entries applied.
fn reconcile_cycle(
    write_log: &WriteLog,
    read_view: &ReadView,
    index: &GraphIndex,
    fold_lock: &Mutex<()>,
    max_batch_size: usize,
) -> usize {
    let _guard = fold_lock.lock();

    let batch = write_log.drain_batch(max_batch_size);
    if batch.is_empty() {
        return 0;
    }

    let current = read_view.load();
    let mut next = GraphSnapshot {
        concepts: current.concepts.clone(),
        associations: current.associations.clone(),
        concept_tombstones: current.concept_tombstones.clone(),
        association_tombstones: current.association_tombstones.clone(),
        sequence: current.sequence,
        timestamp: current_timestamp_us(),
    };

    for (sequence, entry) in &batch {
        apply_entry(&mut next, index, entry);
        // Reconciled-up-to advances past every applied WAL sequence.
        // Access recording is not WAL-backed and must not move it.
        if !matches!(entry, WriteEntry::RecordAccess { .. }) {
            next.sequence = next.sequence.max(sequence + 1);
        }
    }

    let count = batch.len();
    read_view.store(next);
    count
}

/// Apply one write entry to a snapshot under construction plus the
/// shared indexes. Also used by recovery when replaying the WAL tail.
pub(crate) fn apply_entry(snapshot: &mut GraphSnapshot, index: &GraphIndex, entry: &WriteEntry) {
    match entry {
        WriteEntry::AddConcept {
            id,
            content,
            vector,
            strength,
            confidence,
            semantic,
            timestamp,
        } => {
            // Whole-record replacement; only the creation timestamp
            // survives from a previous version.
            let created = snapshot
                .concepts
                .get(id)
                .map(|node| node.created)
                .unwrap_or(*timestamp);
            let node = ConceptNode::new(
                *id,
                content.to_vec(),
                vector.as_ref().map(|v| v.to_vec()),
                *strength,
                *confidence,
                semantic.clone(),
                created,
                *timestamp,
            );
            snapshot.concepts.insert(*id, node);
            snapshot.concept_tombstones.remove(id);

            index.insert_concept(*id, ConceptLocation::Memory, created);
            index.index_content(*id, content);
        }

        WriteEntry::AddAssociation { record, side } => {
            let mut stored = *record;
            match side {
                EdgeSide::Forward => stored.flags |= ASSOC_FLAG_FORWARD_ONLY,
                EdgeSide::Inverse => stored.flags |= ASSOC_FLAG_INVERSE_ONLY,
                EdgeSide::Both => {}
            }
            let key = (stored.source_id, stored.target_id, stored.assoc_type);
            index.add_edge(record, *side);
            snapshot.associations.insert(key, stored);
            snapshot.association_tombstones.remove(&key);
        }

        WriteEntry::RecordAccess { id, timestamp } => {
            if let Some(mut node) = snapshot.concepts.get(id).cloned() {
                node.access_count += 1;
                node.modified = node.modified.max(*timestamp);
                snapshot.concepts.insert(*id, node);
            }
        }

        WriteEntry::DeleteConcept { id, timestamp } => {
            if snapshot.concepts.remove(id).is_some() {
                snapshot.concept_tombstones.insert(*id, *timestamp);
            }
            index.remove_concept(*id);
        }

        WriteEntry::DeleteAssociation {
            source,
            target,
            assoc_type,
            timestamp,
        } => {
            let key = (*source, *target, *assoc_type);
            if snapshot.associations.remove(&key).is_some() {
                snapshot.association_tombstones.insert(key, *timestamp);
            }
            if let Some(t) = crate::types::AssociationType::from_u8(*assoc_type) {
                index.remove_edge(*source, *target, t, EdgeSide::Both);
            }
        }
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
    use crate::types::{AssociationRecord, AssociationType, ConceptId};
    use std::time::Duration;

    fn setup() -> (Arc<WriteLog>, Arc<ReadView>, Arc<GraphIndex>) {
        (
            Arc::new(WriteLog::new()),
            Arc::new(ReadView::new()),
            Arc::new(GraphIndex::new()),
        )
    }

    fn concept_entry(n: u8, timestamp: u64) -> WriteEntry {
        WriteEntry::AddConcept {
            id: ConceptId([n; 16]),
            content: format!("concept {}", n).into_bytes().into_boxed_slice(),
            vector: None,
            strength: 1.0,
            confidence: 0.9,
            semantic: None,
            timestamp,
        }
    }

    #[test]
    fn test_background_reconcile() {
        let (write_log, read_view, index) = setup();
        let mut reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&index),
        );
        reconciler.start();

        for i in 0..50u8 {
            write_log.append(i as u64, concept_entry(i, 1000)).unwrap();
        }

        // Wait for the background thread to fold the batch.
        for _ in 0..100 {
            if read_view.load().concept_count() == 50 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(read_view.load().concept_count(), 50);
        assert_eq!(read_view.load().sequence, 50);
        let stats = reconciler.stats();
        assert!(stats.entries_processed >= 50);
        assert_eq!(stats.reconciled_sequence, 50);

        reconciler.stop();
    }

    #[test]
    fn test_reconcile_now_drains_everything() {
        let (write_log, read_view, index) = setup();
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&index),
        );

        for i in 0..10u8 {
            write_log.append(i as u64, concept_entry(i, 1000)).unwrap();
        }

        let processed = reconciler.reconcile_now();
        assert_eq!(processed, 10);
        assert_eq!(read_view.load().concept_count(), 10);
        assert_eq!(write_log.pending(), 0);
    }

    #[test]
    fn test_replacement_keeps_created_timestamp() {
        let (write_log, read_view, index) = setup();
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&index),
        );

        write_log.append(0, concept_entry(1, 1000)).unwrap();
        reconciler.reconcile_now();
        write_log.append(1, concept_entry(1, 9999)).unwrap();
        reconciler.reconcile_now();

        let node = read_view.load().get_concept(&ConceptId([1; 16])).unwrap();
        assert_eq!(node.created, 1000);
        assert_eq!(node.modified, 9999);
    }

    #[test]
    fn test_association_and_deletion_fold() {
        let (write_log, read_view, index) = setup();
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&index),
        );

        let a = ConceptId([1; 16]);
        let b = ConceptId([2; 16]);
        let record = AssociationRecord::new(a, b, AssociationType::Semantic, 0.8, 1000);

        write_log.append(0, concept_entry(1, 1000)).unwrap();
        write_log
            .append(
                1,
                WriteEntry::AddAssociation {
                    record,
                    side: EdgeSide::Both,
                },
            )
            .unwrap();
        reconciler.reconcile_now();

        let snap = read_view.load();
        assert_eq!(snap.edge_count(), 1);
        assert_eq!(index.neighbors(a, None).len(), 1);
        assert_eq!(index.neighbors(b, None).len(), 1);

        write_log
            .append(
                2,
                WriteEntry::DeleteConcept {
                    id: a,
                    timestamp: 2000,
                },
            )
            .unwrap();
        reconciler.reconcile_now();

        let snap = read_view.load();
        assert!(!snap.contains(&a));
        assert_eq!(snap.concept_tombstones.get(&a), Some(&2000));
        assert_eq!(snap.sequence, 3);
    }

    #[test]
    fn test_monotone_visibility() {
        let (write_log, read_view, index) = setup();
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&index),
        );

        write_log.append(0, concept_entry(1, 1000)).unwrap();
        reconciler.reconcile_now();
        let s1 = read_view.load();

        write_log.append(1, concept_entry(2, 1000)).unwrap();
        reconciler.reconcile_now();
        let s2 = read_view.load();

        assert!(s1.sequence <= s2.sequence);
        // Every concept visible in s1 is visible in s2.
        for id in s1.concepts.keys() {
            assert!(s2.contains(id));
        }
    }
}
