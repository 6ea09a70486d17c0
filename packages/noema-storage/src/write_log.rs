/// Lock-free write log for the write plane
///
/// Append-only structure optimized for burst writes. Writers never
/// block; the single consumer is the reconciler. A full log yields a
/// backpressure error to the caller rather than dropping acknowledged
/// entries.
use crate::semantic::SemanticMetadata;
use crate::types::{AssociationRecord, ConceptId};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum write log entries before backpressure
const MAX_WRITE_LOG_SIZE: usize = 100_000;

/// Which adjacency directions an association write materializes.
///
/// Same-shard writes install both directions. A cross-shard write is
/// split: the source shard installs the forward edge, the target shard
/// the inverse edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeSide {
    Both,
    Forward,
    Inverse,
}

/// Write log entry types
#[derive(Debug, Clone)]
pub enum WriteEntry {
    /// Add or replace a concept
    AddConcept {
        id: ConceptId,
        content: Box<[u8]>,
        vector: Option<Box<[f32]>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
        timestamp: u64,
    },

    /// Add or replace an association
    AddAssociation {
        record: AssociationRecord,
        side: EdgeSide,
    },

    /// Record access (for heat tracking)
    RecordAccess { id: ConceptId, timestamp: u64 },

    /// Delete a concept (tombstone)
    DeleteConcept { id: ConceptId, timestamp: u64 },

    /// Delete an association (tombstone)
    DeleteAssociation {
        source: ConceptId,
        target: ConceptId,
        assoc_type: u8,
        timestamp: u64,
    },
}

/// Lock-free write log (multi-producer, single-consumer)
pub struct WriteLog {
    sender: Sender<(u64, WriteEntry)>,
    receiver: Receiver<(u64, WriteEntry)>,
    /// Sequence of the next entry (mirrors the WAL sequence)
    sequence: Arc<AtomicU64>,
    /// Rejected appends (backpressure metric)
    rejected: Arc<AtomicU64>,
    /// Total accepted
    written: Arc<AtomicU64>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_WRITE_LOG_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);

        Self {
            sender,
            receiver,
            sequence: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// True when another append would be rejected. Callers check this
    /// before logging to the WAL so a refused write leaves no trace.
    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    /// Append an entry tagged with its WAL sequence (non-blocking)
    pub fn append(&self, sequence: u64, entry: WriteEntry) -> std::result::Result<u64, WriteLogError> {
        match self.sender.try_send((sequence, entry)) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                self.sequence.fetch_max(sequence + 1, Ordering::Relaxed);
                Ok(sequence)
            }
            Err(TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(WriteLogError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(WriteLogError::Disconnected),
        }
    }

    /// Drain up to N entries (for the reconciler)
    pub fn drain_batch(&self, max_entries: usize) -> Vec<(u64, WriteEntry)> {
        let mut batch = Vec::with_capacity(max_entries.min(1024));

        for _ in 0..max_entries {
            match self.receiver.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        batch
    }

    /// Drain all available entries
    pub fn drain_all(&self) -> Vec<(u64, WriteEntry)> {
        self.drain_batch(usize::MAX)
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(usize::MAX)
    }

    pub fn stats(&self) -> WriteLogStats {
        WriteLogStats {
            sequence: self.sequence.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending: self.receiver.len(),
            capacity: self.capacity(),
        }
    }
}

impl Default for WriteLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Write log statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WriteLogStats {
    pub sequence: u64,
    pub written: u64,
    pub rejected: u64,
    pub pending: usize,
    pub capacity: usize,
}

/// Write log errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteLogError {
    /// Log is full (backpressure)
    Full,
    /// Channel disconnected
    Disconnected,
}

impl std::fmt::Display for WriteLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "write log full (backpressure)"),
            Self::Disconnected => write!(f, "write log disconnected"),
        }
    }
}

impl std::error::Error for WriteLogError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssociationType;

    fn concept_entry(n: u8) -> WriteEntry {
        WriteEntry::AddConcept {
            id: ConceptId([n; 16]),
            content: vec![n].into_boxed_slice(),
            vector: None,
            strength: 1.0,
            confidence: 0.9,
            semantic: None,
            timestamp: 1000,
        }
    }

    #[test]
    fn test_append_and_drain() {
        let log = WriteLog::new();

        for i in 0..10u8 {
            log.append(i as u64, concept_entry(i)).unwrap();
        }

        let stats = log.stats();
        assert_eq!(stats.written, 10);
        assert_eq!(stats.pending, 10);

        let batch = log.drain_batch(5);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].0, 0);
        assert_eq!(log.pending(), 5);

        let rest = log.drain_all();
        assert_eq!(rest.len(), 5);
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn test_full_log_rejects() {
        let log = WriteLog::with_capacity(4);

        for i in 0..4u8 {
            log.append(i as u64, concept_entry(i)).unwrap();
        }
        assert!(log.is_full());

        let err = log.append(4, concept_entry(4)).unwrap_err();
        assert_eq!(err, WriteLogError::Full);
        assert_eq!(log.stats().rejected, 1);

        // Draining frees capacity again.
        log.drain_batch(1);
        log.append(4, concept_entry(4)).unwrap();
    }

    #[test]
    fn test_association_entry() {
        let log = WriteLog::new();

        let record = AssociationRecord::new(
            ConceptId([1; 16]),
            ConceptId([2; 16]),
            AssociationType::Semantic,
            0.8,
            1000,
        );
        log.append(
            0,
            WriteEntry::AddAssociation {
                record,
                side: EdgeSide::Both,
            },
        )
        .unwrap();

        let batch = log.drain_all();
        assert_eq!(batch.len(), 1);
        match &batch[0].1 {
            WriteEntry::AddAssociation { record, side } => {
                assert_eq!(record.source_id, ConceptId([1; 16]));
                assert_eq!(*side, EdgeSide::Both);
            }
            _ => panic!("expected AddAssociation"),
        }
    }
}
