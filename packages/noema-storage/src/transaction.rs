/// Two-phase commit coordinator for cross-shard association writes
///
/// Protocol:
/// 1. Begin: allocate a transaction id, record BeginTxn on both shards
/// 2. Prepare: each shard durably logs the association as prepared
///    (invisible to readers) and acknowledges
/// 3. Decide: if every participant prepared within the timeout the
///    coordinator appends Commit to its own decision log, then tells
///    both shards to commit; otherwise both abort
///
/// The decision log is the recovery authority: a shard restarting with
/// a prepared-but-undecided transaction asks it for the outcome, and
/// aborts when no decision is known.
use crate::error::{EngineError, Result};
use crc32fast::Hasher as Crc32;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Preparing,
    Prepared,
    Committed,
    Aborted,
}

/// Durable outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnDecision {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionRecord {
    txn_id: u64,
    decision: TxnDecision,
}

/// One in-flight transaction
#[derive(Debug, Clone)]
struct ActiveTxn {
    participants: Vec<u32>,
    prepared: Vec<u32>,
    state: TxnState,
    started_at: Instant,
}

/// Coordinator statistics
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorStats {
    pub active: usize,
    pub decided: usize,
    pub committed: u64,
    pub aborted: u64,
}

/// Two-phase commit coordinator with a durable decision log
pub struct TransactionCoordinator {
    log_path: PathBuf,
    log_file: Mutex<File>,
    decided: RwLock<HashMap<u64, TxnDecision>>,
    active: RwLock<HashMap<u64, ActiveTxn>>,
    next_txn_id: AtomicU64,
    timeout: Duration,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionCoordinator {
    /// Open the coordinator, replaying its decision log.
    pub fn open<P: AsRef<Path>>(dir: P, timeout: Duration) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("decisions.log");

        let mut decided = HashMap::new();
        let mut max_txn_id = 0u64;
        if log_path.exists() {
            let mut bytes = Vec::new();
            File::open(&log_path)?.read_to_end(&mut bytes)?;
            let mut offset = 0usize;
            while offset + 8 <= bytes.len() {
                let len =
                    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
                let body_start = offset + 4;
                let body_end = body_start + len;
                let frame_end = body_end + 4;
                if len == 0 || frame_end > bytes.len() {
                    break;
                }
                let body = &bytes[body_start..body_end];
                let stored_crc =
                    u32::from_le_bytes(bytes[body_end..frame_end].try_into().unwrap());
                let mut hasher = Crc32::new();
                hasher.update(body);
                if hasher.finalize() != stored_crc {
                    log::warn!("decision log truncated at corrupt frame (offset {})", offset);
                    break;
                }
                match rmp_serde::from_slice::<DecisionRecord>(body) {
                    Ok(record) => {
                        max_txn_id = max_txn_id.max(record.txn_id);
                        decided.insert(record.txn_id, record.decision);
                    }
                    Err(_) => break,
                }
                offset = frame_end;
            }
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            log_path,
            log_file: Mutex::new(log_file),
            decided: RwLock::new(decided),
            active: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            timeout,
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a transaction across the given participant shards
    pub fn begin(&self, participants: Vec<u32>) -> u64 {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.active.write().insert(
            txn_id,
            ActiveTxn {
                participants,
                prepared: Vec::new(),
                state: TxnState::Preparing,
                started_at: Instant::now(),
            },
        );
        txn_id
    }

    /// Record a participant's prepare acknowledgement. Errors if the
    /// transaction has already run past its decision timeout.
    pub fn mark_prepared(&self, txn_id: u64, shard_id: u32) -> Result<()> {
        let mut active = self.active.write();
        let txn = active
            .get_mut(&txn_id)
            .ok_or_else(|| EngineError::NotFound(format!("transaction {}", txn_id)))?;

        if txn.started_at.elapsed() > self.timeout {
            txn.state = TxnState::Aborted;
            return Err(EngineError::TransactionAborted(
                txn_id,
                "prepare timed out".into(),
            ));
        }
        if !txn.participants.contains(&shard_id) {
            return Err(EngineError::Validation(format!(
                "shard {} is not a participant of transaction {}",
                shard_id, txn_id
            )));
        }
        if !txn.prepared.contains(&shard_id) {
            txn.prepared.push(shard_id);
        }
        if txn.prepared.len() == txn.participants.len() {
            txn.state = TxnState::Prepared;
        }
        Ok(())
    }

    pub fn is_prepared(&self, txn_id: u64) -> bool {
        self.active
            .read()
            .get(&txn_id)
            .map(|txn| txn.state == TxnState::Prepared)
            .unwrap_or(false)
    }

    /// Durably record the outcome. This is the commit point: once the
    /// record is fsynced the decision survives any crash.
    pub fn record_decision(&self, txn_id: u64, decision: TxnDecision) -> Result<()> {
        let body = rmp_serde::to_vec(&DecisionRecord { txn_id, decision })
            .map_err(|e| EngineError::FatalIo(format!("decision encode: {}", e)))?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        {
            let mut file = self.log_file.lock();
            file.write_all(&(body.len() as u32).to_le_bytes())?;
            file.write_all(&body)?;
            file.write_all(&crc.to_le_bytes())?;
            file.sync_all()
                .map_err(|e| EngineError::FatalIo(format!("decision fsync: {}", e)))?;
        }

        self.decided.write().insert(txn_id, decision);
        let mut active = self.active.write();
        if let Some(txn) = active.get_mut(&txn_id) {
            txn.state = match decision {
                TxnDecision::Commit => TxnState::Committed,
                TxnDecision::Abort => TxnState::Aborted,
            };
        }
        match decision {
            TxnDecision::Commit => self.committed.fetch_add(1, Ordering::Relaxed),
            TxnDecision::Abort => self.aborted.fetch_add(1, Ordering::Relaxed),
        };
        Ok(())
    }

    /// Outcome of a past transaction, if one was ever recorded. Used by
    /// shard recovery to resolve prepared-but-undecided transactions.
    pub fn decision_for(&self, txn_id: u64) -> Option<TxnDecision> {
        self.decided.read().get(&txn_id).copied()
    }

    /// Forget a finished transaction
    pub fn complete(&self, txn_id: u64) {
        self.active.write().remove(&txn_id);
    }

    /// Abort every transaction that outlived the timeout; returns how
    /// many were reaped.
    pub fn reap_timed_out(&self) -> Result<usize> {
        let expired: Vec<u64> = {
            let active = self.active.read();
            active
                .iter()
                .filter(|(_, txn)| {
                    txn.started_at.elapsed() > self.timeout
                        && matches!(txn.state, TxnState::Preparing | TxnState::Prepared)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for txn_id in &expired {
            self.record_decision(*txn_id, TxnDecision::Abort)?;
            self.complete(*txn_id);
        }
        Ok(expired.len())
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            active: self.active.read().len(),
            decided: self.decided.read().len(),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_two_participant_protocol() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path(), Duration::from_secs(5)).unwrap();

        let txn_id = coordinator.begin(vec![0, 1]);
        assert!(!coordinator.is_prepared(txn_id));

        coordinator.mark_prepared(txn_id, 0).unwrap();
        assert!(!coordinator.is_prepared(txn_id));

        coordinator.mark_prepared(txn_id, 1).unwrap();
        assert!(coordinator.is_prepared(txn_id));

        coordinator
            .record_decision(txn_id, TxnDecision::Commit)
            .unwrap();
        assert_eq!(coordinator.decision_for(txn_id), Some(TxnDecision::Commit));
        coordinator.complete(txn_id);
        assert_eq!(coordinator.stats().active, 0);
    }

    #[test]
    fn test_non_participant_rejected() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path(), Duration::from_secs(5)).unwrap();

        let txn_id = coordinator.begin(vec![0, 1]);
        assert!(matches!(
            coordinator.mark_prepared(txn_id, 7),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_timeout_aborts_prepare() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path(), Duration::from_millis(50)).unwrap();

        let txn_id = coordinator.begin(vec![0, 1]);
        std::thread::sleep(Duration::from_millis(80));

        assert!(matches!(
            coordinator.mark_prepared(txn_id, 0),
            Err(EngineError::TransactionAborted(_, _))
        ));
    }

    #[test]
    fn test_decisions_survive_restart() {
        let dir = TempDir::new().unwrap();

        let (committed_id, aborted_id) = {
            let coordinator =
                TransactionCoordinator::open(dir.path(), Duration::from_secs(5)).unwrap();
            let c = coordinator.begin(vec![0, 1]);
            let a = coordinator.begin(vec![0, 1]);
            coordinator.record_decision(c, TxnDecision::Commit).unwrap();
            coordinator.record_decision(a, TxnDecision::Abort).unwrap();
            (c, a)
        };

        let coordinator =
            TransactionCoordinator::open(dir.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            coordinator.decision_for(committed_id),
            Some(TxnDecision::Commit)
        );
        assert_eq!(
            coordinator.decision_for(aborted_id),
            Some(TxnDecision::Abort)
        );
        // Unknown transactions have no decision; recovery aborts them.
        assert_eq!(coordinator.decision_for(9999), None);

        // Ids never repeat after restart.
        let next = coordinator.begin(vec![0]);
        assert!(next > aborted_id);
    }

    #[test]
    fn test_corrupt_decision_tail_ignored() {
        let dir = TempDir::new().unwrap();

        let txn_id = {
            let coordinator =
                TransactionCoordinator::open(dir.path(), Duration::from_secs(5)).unwrap();
            let id = coordinator.begin(vec![0, 1]);
            coordinator.record_decision(id, TxnDecision::Commit).unwrap();
            id
        };

        // Garbage at the tail.
        let path = dir.path().join("decisions.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x05])
            .unwrap();
        drop(file);

        let coordinator =
            TransactionCoordinator::open(dir.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(coordinator.decision_for(txn_id), Some(TxnDecision::Commit));
    }

    #[test]
    fn test_reap_timed_out() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path(), Duration::from_millis(30)).unwrap();

        let a = coordinator.begin(vec![0, 1]);
        let b = coordinator.begin(vec![0, 1]);
        std::thread::sleep(Duration::from_millis(60));

        let reaped = coordinator.reap_timed_out().unwrap();
        assert_eq!(reaped, 2);
        assert_eq!(coordinator.decision_for(a), Some(TxnDecision::Abort));
        assert_eq!(coordinator.decision_for(b), Some(TxnDecision::Abort));
        assert_eq!(coordinator.stats().active, 0);
    }
}
