/// Write-Ahead Log (WAL) for durability and crash recovery
///
/// Durably orders every mutation before it touches visible state. On
/// crash, replay reconstructs everything that was acknowledged.
///
/// On-disk layout, per rotated file `wal/NNNNN.log`:
///
/// ```text
/// [LEN_LE_U32][RECORD_BYTES][CRC32_LE_U32]
/// [LEN_LE_U32][RECORD_BYTES][CRC32_LE_U32]
/// ...
/// ```
///
/// Record bytes are MessagePack; the CRC32 covers the record bytes. A
/// torn or checksum-failing frame terminates replay cleanly: no later
/// record is accepted after a bad frame, and recovery truncates the log
/// at that point.
use crate::config::FsyncPolicy;
use crate::error::{EngineError, Result};
use crate::semantic::SemanticMetadata;
use crate::types::{AssociationType, ConceptId};
use crate::write_log::EdgeSide;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound on a single framed record; anything larger is corruption.
/// Sized for a 10 MiB content payload plus vector and envelope.
const MAX_FRAME_LEN: u32 = 24 * 1024 * 1024;

/// WAL operation type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalOp {
    /// Write (or replace) a concept
    WriteConcept {
        concept_id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
        created: u64,
        modified: u64,
    },
    /// Write (or replace) an association
    WriteAssociation {
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
        side: EdgeSide,
        created: u64,
    },
    /// Delete a concept (tombstone)
    DeleteConcept { concept_id: ConceptId, timestamp: u64 },
    /// Delete an association (tombstone)
    DeleteAssociation {
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        timestamp: u64,
    },
    /// Begin a cross-shard transaction
    BeginTxn { txn_id: u64 },
    /// Durably prepared association write, invisible until commit
    PrepareTxn {
        txn_id: u64,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
        side: EdgeSide,
        created: u64,
    },
    /// Commit a cross-shard transaction
    CommitTxn { txn_id: u64 },
    /// Abort a cross-shard transaction
    AbortTxn { txn_id: u64 },
}

/// One framed WAL entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    /// Sequence number (monotonically increasing per shard)
    pub sequence: u64,
    /// Timestamp (microseconds since epoch)
    pub timestamp: u64,
    pub op: WalOp,
}

/// Replay outcome
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    /// Records successfully replayed
    pub records: u64,
    /// Trailing bytes dropped at the first bad frame
    pub dropped_bytes: u64,
    /// Whether a torn or corrupt tail was found
    pub truncated: bool,
}

struct SealedFile {
    id: u64,
    first_sequence: u64,
    last_sequence: u64,
}

/// Write-Ahead Log over a directory of rotated files
pub struct WriteAheadLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    active_id: u64,
    active_first_sequence: u64,
    active_records: u64,
    active_bytes: u64,
    sealed: Vec<SealedFile>,
    next_sequence: u64,
    fsync: FsyncPolicy,
    rotation_limit: u64,
}

fn file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:05}.log", id))
}

fn list_log_files(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".log") {
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Scan one file, yielding good records; returns (records, good_offset,
/// file_len, saw_bad_frame).
fn scan_file<F: FnMut(WalRecord)>(
    path: &Path,
    visitor: &mut F,
) -> Result<(u64, u64, u64, bool)> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut offset = 0usize;
    let mut records = 0u64;
    loop {
        if offset + 8 > buf.len() {
            // not even a length prefix + checksum left
            break;
        }
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        if len == 0 || len > MAX_FRAME_LEN {
            return Ok((records, offset as u64, file_len, true));
        }
        let body_start = offset + 4;
        let body_end = body_start + len as usize;
        let frame_end = body_end + 4;
        if frame_end > buf.len() {
            // torn write at the tail
            return Ok((records, offset as u64, file_len, true));
        }
        let body = &buf[body_start..body_end];
        let stored_crc = u32::from_le_bytes(buf[body_end..frame_end].try_into().unwrap());
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Ok((records, offset as u64, file_len, true));
        }
        let record: WalRecord = match rmp_serde::from_slice(body) {
            Ok(r) => r,
            Err(_) => return Ok((records, offset as u64, file_len, true)),
        };
        visitor(record);
        records += 1;
        offset = frame_end;
    }
    Ok((records, offset as u64, file_len, offset as u64 != file_len))
}

impl WriteAheadLog {
    /// Replay all rotated files in order, yielding each record to the
    /// visitor. Stops at the first bad frame; later files are not read.
    pub fn replay<F: FnMut(WalRecord)>(dir: &Path, mut visitor: F) -> Result<FrameStats> {
        let mut stats = FrameStats::default();
        let ids = list_log_files(dir)?;
        for (idx, id) in ids.iter().enumerate() {
            let path = file_path(dir, *id);
            let (records, good_offset, file_len, bad) = scan_file(&path, &mut visitor)?;
            stats.records += records;
            if bad {
                stats.truncated = true;
                stats.dropped_bytes += file_len - good_offset;
                // everything after the bad frame is lost, including later files
                for later in &ids[idx + 1..] {
                    let later_path = file_path(dir, *later);
                    if let Ok(meta) = std::fs::metadata(&later_path) {
                        stats.dropped_bytes += meta.len();
                    }
                }
                break;
            }
        }
        Ok(stats)
    }

    /// Open the log for appending, repairing any torn tail first.
    pub fn open(dir: &Path, fsync: FsyncPolicy, rotation_limit: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let ids = list_log_files(dir)?;

        let mut sealed = Vec::new();
        let mut next_sequence = 0u64;
        let mut bad_from: Option<(usize, u64, u64)> = None; // (idx, id, good_offset)

        for (idx, id) in ids.iter().enumerate() {
            let path = file_path(dir, *id);
            let mut first = None;
            let mut last = None;
            let (records, good_offset, file_len, bad) = scan_file(&path, &mut |r: WalRecord| {
                if first.is_none() {
                    first = Some(r.sequence);
                }
                last = Some(r.sequence);
            })?;
            if let Some(last_seq) = last {
                next_sequence = last_seq + 1;
            }
            if records > 0 {
                sealed.push(SealedFile {
                    id: *id,
                    first_sequence: first.unwrap(),
                    last_sequence: last.unwrap(),
                });
            }
            if bad && good_offset != file_len {
                bad_from = Some((idx, *id, good_offset));
                break;
            }
        }

        if let Some((idx, id, good_offset)) = bad_from {
            let path = file_path(dir, id);
            let lost = std::fs::metadata(&path)?.len() - good_offset;
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(good_offset)?;
            file.sync_all()?;
            let mut lost_total = lost;
            for later in &ids[idx + 1..] {
                let later_path = file_path(dir, *later);
                if let Ok(meta) = std::fs::metadata(&later_path) {
                    lost_total += meta.len();
                }
                std::fs::remove_file(&later_path)?;
            }
            log::warn!(
                "WAL recovery truncated {} byte(s) after a corrupt frame in {:05}.log",
                lost_total,
                id
            );
        }

        // Append to the last surviving file, or start a fresh one.
        let active_id = sealed.last().map(|f| f.id).unwrap_or(0);
        let active = sealed.pop();
        let (active_first_sequence, active_records) = active
            .as_ref()
            .map(|f| (f.first_sequence, f.last_sequence - f.first_sequence + 1))
            .unwrap_or((next_sequence, 0));

        let path = file_path(dir, active_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let active_bytes = file.metadata()?.len();

        Ok(Self {
            dir: dir.to_path_buf(),
            writer: BufWriter::new(file),
            active_id,
            active_first_sequence,
            active_records,
            active_bytes,
            sealed,
            next_sequence,
            fsync,
            rotation_limit,
        })
    }

    /// Append an operation; returns its sequence once the record is
    /// durable under the configured fsync policy.
    pub fn append(&mut self, op: WalOp) -> Result<u64> {
        let sequence = self.next_sequence;
        let record = WalRecord {
            sequence,
            timestamp: now_micros(),
            op,
        };

        let body = rmp_serde::to_vec(&record)
            .map_err(|e| EngineError::FatalIo(format!("WAL encode: {}", e)))?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let io = |e: std::io::Error| EngineError::FatalIo(format!("WAL append: {}", e));
        self.writer
            .write_all(&(body.len() as u32).to_le_bytes())
            .map_err(io)?;
        self.writer.write_all(&body).map_err(io)?;
        self.writer.write_all(&crc.to_le_bytes()).map_err(io)?;

        if matches!(self.fsync, FsyncPolicy::Always) {
            self.writer.flush().map_err(io)?;
            self.writer.get_ref().sync_all().map_err(io)?;
        }

        self.next_sequence += 1;
        if self.active_records == 0 {
            self.active_first_sequence = sequence;
        }
        self.active_records += 1;
        self.active_bytes += 8 + body.len() as u64;

        if self.active_bytes >= self.rotation_limit {
            self.rotate()?;
        }

        Ok(sequence)
    }

    /// Flush and fsync buffered records (Batch policy)
    pub fn sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| EngineError::FatalIo(format!("WAL flush: {}", e)))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| EngineError::FatalIo(format!("WAL fsync: {}", e)))?;
        Ok(())
    }

    /// Seal the active file and open the next one
    pub fn rotate(&mut self) -> Result<()> {
        self.sync()?;
        if self.active_records > 0 {
            self.sealed.push(SealedFile {
                id: self.active_id,
                first_sequence: self.active_first_sequence,
                last_sequence: self.next_sequence - 1,
            });
            self.active_id += 1;
        } else if self.active_bytes > 0 {
            self.active_id += 1;
        } else {
            return Ok(()); // nothing written, keep the empty file
        }

        let path = file_path(&self.dir, self.active_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = BufWriter::new(file);
        self.active_first_sequence = self.next_sequence;
        self.active_records = 0;
        self.active_bytes = 0;
        Ok(())
    }

    /// Drop whole files whose records are all at or below `up_to`. The
    /// caller guarantees those records are captured in a segment.
    pub fn truncate(&mut self, up_to: u64) -> Result<()> {
        // Seal the active file first if everything in it is covered.
        if self.active_records > 0 && self.next_sequence - 1 <= up_to {
            self.rotate()?;
        }
        let mut kept = Vec::new();
        for sealed in self.sealed.drain(..) {
            if sealed.last_sequence <= up_to {
                std::fs::remove_file(file_path(&self.dir, sealed.id))?;
            } else {
                kept.push(sealed);
            }
        }
        self.sealed = kept;
        Ok(())
    }

    /// Next sequence to be assigned; equals the count of records ever
    /// appended to this log directory.
    pub fn sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Id of the file currently receiving appends
    pub fn active_file_id(&self) -> u64 {
        self.active_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
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

    fn write_concept_op(n: u64) -> WalOp {
        WalOp::WriteConcept {
            concept_id: test_id(n),
            content: format!("concept {}", n).into_bytes(),
            vector: None,
            strength: 1.0,
            confidence: 0.9,
            semantic: None,
            created: 1000,
            modified: 1000,
        }
    }

    #[test]
    fn test_append_assigns_sequences() {
        let dir = TempDir::new().unwrap();
        let mut wal =
            WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();

        assert_eq!(wal.append(write_concept_op(1)).unwrap(), 0);
        assert_eq!(wal.append(write_concept_op(2)).unwrap(), 1);
        assert_eq!(wal.sequence(), 2);
    }

    #[test]
    fn test_replay_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal =
                WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();
            wal.append(write_concept_op(1)).unwrap();
            wal.append(WalOp::DeleteConcept {
                concept_id: test_id(1),
                timestamp: 2000,
            })
            .unwrap();
        }

        let mut records = Vec::new();
        let stats = WriteAheadLog::replay(dir.path(), |r| records.push(r)).unwrap();

        assert_eq!(stats.records, 2);
        assert!(!stats.truncated);
        assert_eq!(records[0].sequence, 0);
        assert!(matches!(records[0].op, WalOp::WriteConcept { .. }));
        assert!(matches!(records[1].op, WalOp::DeleteConcept { .. }));
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal =
                WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();
            wal.append(write_concept_op(1)).unwrap();
            wal.append(write_concept_op(2)).unwrap();
        }
        let mut wal =
            WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();
        assert_eq!(wal.sequence(), 2);
        assert_eq!(wal.append(write_concept_op(3)).unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_truncates_cleanly() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal =
                WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();
            wal.append(write_concept_op(1)).unwrap();
            wal.append(write_concept_op(2)).unwrap();
        }

        // Simulate a torn write: garbage half-frame at the tail.
        let path = dir.path().join("00000.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&200u32.to_le_bytes()).unwrap();
        file.write_all(b"partial garbage").unwrap();
        drop(file);

        let mut count = 0;
        let stats = WriteAheadLog::replay(dir.path(), |_| count += 1).unwrap();
        assert_eq!(count, 2);
        assert!(stats.truncated);
        assert!(stats.dropped_bytes > 0);

        // Reopen repairs the tail and appends continue from sequence 2.
        let mut wal =
            WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();
        assert_eq!(wal.append(write_concept_op(3)).unwrap(), 2);

        let mut seqs = Vec::new();
        WriteAheadLog::replay(dir.path(), |r| seqs.push(r.sequence)).unwrap();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_corrupt_crc_stops_replay() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal =
                WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();
            wal.append(write_concept_op(1)).unwrap();
            wal.append(write_concept_op(2)).unwrap();
        }

        // Flip a byte inside the second frame's body.
        let path = dir.path().join("00000.log");
        let mut bytes = std::fs::read(&path).unwrap();
        let first_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let second_body = 4 + first_len + 4 + 4 + 2;
        bytes[second_body] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut count = 0;
        let stats = WriteAheadLog::replay(dir.path(), |_| count += 1).unwrap();
        assert_eq!(count, 1);
        assert!(stats.truncated);
    }

    #[test]
    fn test_rotation() {
        let dir = TempDir::new().unwrap();
        // Tiny rotation limit forces a new file per record.
        let mut wal = WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64).unwrap();
        for i in 0..5 {
            wal.append(write_concept_op(i)).unwrap();
        }
        drop(wal);

        let ids = list_log_files(dir.path()).unwrap();
        assert!(ids.len() >= 5);

        let mut seqs = Vec::new();
        WriteAheadLog::replay(dir.path(), |r| seqs.push(r.sequence)).unwrap();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_truncate_drops_covered_files() {
        let dir = TempDir::new().unwrap();
        let mut wal = WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64).unwrap();
        for i in 0..5 {
            wal.append(write_concept_op(i)).unwrap();
        }
        wal.truncate(4).unwrap();

        let mut count = 0;
        WriteAheadLog::replay(dir.path(), |_| count += 1).unwrap();
        assert_eq!(count, 0);

        // Sequences keep climbing after truncation.
        assert_eq!(wal.append(write_concept_op(9)).unwrap(), 5);
    }

    #[test]
    fn test_batch_policy_requires_sync() {
        let dir = TempDir::new().unwrap();
        let mut wal = WriteAheadLog::open(dir.path(), FsyncPolicy::Batch, 64 * 1024 * 1024).unwrap();
        wal.append(write_concept_op(1)).unwrap();
        wal.sync().unwrap();

        let mut count = 0;
        WriteAheadLog::replay(dir.path(), |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }
}
