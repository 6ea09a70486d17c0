/// Concurrent memory: one complete storage shard
///
/// Owns the WAL, the write/read planes with their reconciler, the
/// graph indexes, the vector store, the HNSW index and the LSM
/// compactor. Every mutation is ordered by the WAL before it enters
/// the write plane; readers never block.
///
/// Write path: validate → WAL append (fsync) → write log → vector
/// store + HNSW. Read path: snapshot and index lookups only.
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hnsw::{HnswConfig, HnswIndex, HnswStats};
use crate::index::GraphIndex;
use crate::lsm::{CompactionConfig, LsmStats, LsmTree};
use crate::manifest::VectorDescriptor;
use crate::read_view::{ConceptNode, ReadView};
use crate::reconciler::{apply_entry, Reconciler, ReconcilerConfig, ReconcilerStats};
use crate::semantic::SemanticMetadata;
use crate::types::{AssociationRecord, AssociationType, ConceptId, Neighbor};
use crate::vectors::{normalize, VectorConfig, VectorStore, VectorStats};
use crate::wal::{WalOp, WriteAheadLog};
use crate::write_log::{EdgeSide, WriteEntry, WriteLog, WriteLogStats};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cap on transactions sitting in the prepared state
const MAX_PREPARED_TXNS: usize = 1024;

/// An association durably prepared but not yet decided
#[derive(Debug, Clone)]
struct PreparedAssociation {
    source: ConceptId,
    target: ConceptId,
    assoc_type: AssociationType,
    strength: f32,
    side: EdgeSide,
    created: u64,
    wal_sequence: u64,
}

/// Complete per-shard statistics
#[derive(Debug, Clone)]
pub struct ConcurrentStats {
    pub concepts: usize,
    pub edges: usize,
    pub vectors: usize,
    pub wal_appends: u64,
    pub wal_rejected: u64,
    pub reconciliations: u64,
    pub hnsw_fallbacks: u64,
    pub uptime_secs: u64,
    pub write_log: WriteLogStats,
    pub reconciler: ReconcilerStats,
    pub lsm: LsmStats,
    pub vector_store: VectorStats,
    pub hnsw: HnswStats,
}

/// One storage shard
pub struct ConcurrentMemory {
    config: EngineConfig,

    wal: Mutex<WriteAheadLog>,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    index: Arc<GraphIndex>,
    vectors: Arc<VectorStore>,
    hnsw: Arc<HnswIndex>,
    lsm: LsmTree,
    reconciler: Reconciler,

    /// Ids whose HNSW insert failed; vector search scans these raw
    hnsw_fallback: DashSet<ConceptId>,
    hnsw_fallback_count: AtomicU64,

    /// Prepared-but-undecided cross-shard transactions
    pending_prepared: Mutex<HashMap<u64, PreparedAssociation>>,

    /// Set after a fatal error; the shard refuses further writes
    read_only: AtomicBool,
    started_at: Instant,
}

impl ConcurrentMemory {
    /// Open a shard: load segments, replay the WAL tail, resync the
    /// vector and HNSW stores, then start the background tasks.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_path)?;

        let mut lsm = LsmTree::open(
            &config.storage_path,
            CompactionConfig {
                max_segment_size: config.segment_size_limit,
                ..Default::default()
            },
        )?;

        let index = Arc::new(GraphIndex::new());
        let mut snapshot = lsm.load_state(&index)?;

        let vectors = Arc::new(VectorStore::open(
            config.storage_path.join("vectors"),
            VectorConfig {
                dimension: config.vector_dimension,
                num_subvectors: config.pq_subvectors,
                num_centroids: config.pq_centroids,
            },
        )?);

        let hnsw = Arc::new(HnswIndex::new(
            config.storage_path.join("hnsw.idx"),
            HnswConfig {
                dimension: config.vector_dimension,
                max_neighbors: config.hnsw_max_neighbors,
                ef_construction: config.hnsw_ef_construction,
                ef_search: config.hnsw_ef_search,
            },
        ));
        hnsw.load_or_create()?;

        // Replay the WAL tail over the segment state. Mutation records
        // below the reconciled point are already captured in segments;
        // transaction records are tracked regardless of sequence.
        let wal_dir = config.storage_path.join("wal");
        let mut pending: HashMap<u64, PreparedAssociation> = HashMap::new();
        let reconciled = snapshot.sequence;
        {
            let index = Arc::clone(&index);
            let snapshot = &mut snapshot;
            let stats = WriteAheadLog::replay(&wal_dir, |record| {
                replay_record(snapshot, &index, &mut pending, reconciled, record);
            })?;
            if stats.truncated {
                log::warn!(
                    "WAL recovery dropped {} trailing byte(s) after a torn frame",
                    stats.dropped_bytes
                );
            }
            if stats.records > 0 {
                log::info!("replayed {} WAL record(s)", stats.records);
            }
        }

        // Bring the vector store and HNSW in line with the snapshot:
        // anything replayed from the WAL tail is not in their files yet.
        let hnsw_fallback = DashSet::new();
        let hnsw_fallback_count = AtomicU64::new(0);
        for node in snapshot.concepts.values() {
            if let Some(ref vector) = node.vector {
                if !vectors.contains(node.id) {
                    vectors.insert(node.id, vector.to_vec())?;
                }
                if !hnsw.contains(node.id) {
                    let mut normalized = vector.to_vec();
                    normalize(&mut normalized);
                    if let Err(e) = hnsw.insert(node.id, &normalized) {
                        log::warn!("HNSW resync failed for {}: {}", node.id, e);
                        hnsw_fallback.insert(node.id);
                        hnsw_fallback_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let read_view = Arc::new(ReadView::from_snapshot(snapshot));
        let write_log = Arc::new(WriteLog::new());

        let wal = WriteAheadLog::open(&wal_dir, config.wal_fsync, config.wal_rotation_limit)?;

        let mut reconciler = Reconciler::new(
            ReconcilerConfig {
                min_interval_ms: config.reconciler_min_interval_ms,
                max_interval_ms: config.reconciler_max_interval_ms,
                ..Default::default()
            },
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&index),
        );
        reconciler.start();
        lsm.start_background_compaction();

        Ok(Self {
            config,
            wal: Mutex::new(wal),
            write_log,
            read_view,
            index,
            vectors,
            hnsw,
            lsm,
            reconciler,
            hnsw_fallback,
            hnsw_fallback_count,
            pending_prepared: Mutex::new(pending),
            read_only: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(EngineError::FatalIo(
                "shard is read-only after a fatal error".into(),
            ));
        }
        Ok(())
    }

    /// Record a fatal error and fence the shard off from writes
    fn enter_read_only(&self, error: &EngineError) {
        if error.is_fatal() && !self.read_only.swap(true, Ordering::SeqCst) {
            log::error!("shard entering read-only mode: {}", error);
        }
    }

    /// Append to WAL then to the write log, under one lock so a full
    /// write log is detected before anything is durably recorded and a
    /// refused write leaves no trace.
    fn log_mutation(&self, op: WalOp, entry_for: impl FnOnce(u64) -> WriteEntry) -> Result<u64> {
        self.check_writable()?;
        let mut wal = self.wal.lock();

        if self.write_log.is_full() {
            return Err(EngineError::Capacity("write log full".into()));
        }

        let sequence = match wal.append(op) {
            Ok(sequence) => sequence,
            Err(e) => {
                self.enter_read_only(&e);
                return Err(e);
            }
        };

        // The write log only shrinks while we hold the WAL lock, so
        // this append cannot fail on capacity.
        self.write_log
            .append(sequence, entry_for(sequence))
            .map_err(|e| EngineError::Capacity(e.to_string()))?;

        Ok(sequence)
    }

    // ========================
    // WRITE API
    // ========================

    /// Store (or replace) a concept
    pub fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
    ) -> Result<u64> {
        if let Some(ref v) = vector {
            if v.len() != self.config.vector_dimension {
                return Err(EngineError::Validation(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    self.config.vector_dimension,
                    v.len()
                )));
            }
        }

        let now = now_micros();
        let sequence = self.log_mutation(
            WalOp::WriteConcept {
                concept_id: id,
                content: content.clone(),
                vector: vector.clone(),
                strength,
                confidence,
                semantic: semantic.clone(),
                created: now,
                modified: now,
            },
            |_| WriteEntry::AddConcept {
                id,
                content: content.clone().into_boxed_slice(),
                vector: vector.clone().map(Vec::into_boxed_slice),
                strength,
                confidence,
                semantic: semantic.clone(),
                timestamp: now,
            },
        )?;

        // Vector plane: raw store always; HNSW failure degrades that id
        // to linear-scan search without failing the write.
        if let Some(vector) = vector {
            let mut normalized = vector.clone();
            normalize(&mut normalized);
            self.vectors.insert(id, vector)?;
            match self.hnsw.insert(id, &normalized) {
                Ok(()) => {
                    self.hnsw_fallback.remove(&id);
                }
                Err(e) => {
                    log::warn!("HNSW insert failed for {}: {}", id, e);
                    self.hnsw_fallback.insert(id);
                    self.hnsw_fallback_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Ok(sequence)
    }

    /// Store (or replace) an association. Neither endpoint needs to
    /// exist yet; associations may arrive before their concepts.
    pub fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
        side: EdgeSide,
    ) -> Result<u64> {
        let now = now_micros();
        let record = AssociationRecord::new(source, target, assoc_type, strength, now);

        self.log_mutation(
            WalOp::WriteAssociation {
                source,
                target,
                assoc_type,
                strength,
                side,
                created: now,
            },
            |_| WriteEntry::AddAssociation { record, side },
        )
    }

    /// Explicit strength reinforcement: a whole-record replacement with
    /// the new strength (last-writer-wins, like any other learn).
    pub fn reinforce(&self, id: ConceptId, strength: f32) -> Result<u64> {
        self.reconciler.reconcile_now();
        let node = self
            .read_view
            .get_concept(&id)
            .ok_or_else(|| EngineError::NotFound(format!("concept {}", id)))?;

        self.learn_concept(
            id,
            node.content.to_vec(),
            node.vector.as_ref().map(|v| v.to_vec()),
            strength,
            node.confidence,
            node.semantic.clone(),
        )
    }

    /// Record an access for heat tracking. Not WAL-logged: access
    /// counts are non-durable metrics, so the entry must not advance
    /// the reconciled sequence.
    pub fn record_access(&self, id: ConceptId) {
        let _ = self.write_log.append(
            0,
            WriteEntry::RecordAccess {
                id,
                timestamp: now_micros(),
            },
        );
    }

    /// Delete a concept (tombstone)
    pub fn remove_concept(&self, id: ConceptId) -> Result<u64> {
        let now = now_micros();
        let sequence = self.log_mutation(
            WalOp::DeleteConcept {
                concept_id: id,
                timestamp: now,
            },
            |_| WriteEntry::DeleteConcept { id, timestamp: now },
        )?;

        self.vectors.remove(id);
        self.hnsw.remove(id);
        self.hnsw_fallback.remove(&id);

        Ok(sequence)
    }

    /// Delete an association (tombstone)
    pub fn remove_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Result<u64> {
        let now = now_micros();
        self.log_mutation(
            WalOp::DeleteAssociation {
                source,
                target,
                assoc_type,
                timestamp: now,
            },
            |_| WriteEntry::DeleteAssociation {
                source,
                target,
                assoc_type: assoc_type as u8,
                timestamp: now,
            },
        )
    }

    // ========================
    // TWO-PHASE COMMIT PARTICIPANT API
    // ========================

    /// Record the start of a cross-shard transaction
    pub fn begin_txn(&self, txn_id: u64) -> Result<()> {
        self.check_writable()?;
        let mut wal = self.wal.lock();
        wal.append(WalOp::BeginTxn { txn_id }).map_err(|e| {
            self.enter_read_only(&e);
            e
        })?;
        Ok(())
    }

    /// Durably log a prepared association. Invisible to readers until
    /// the commit decision arrives.
    pub fn prepare_association(
        &self,
        txn_id: u64,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
        side: EdgeSide,
    ) -> Result<()> {
        self.check_writable()?;

        let mut pending = self.pending_prepared.lock();
        if pending.len() >= MAX_PREPARED_TXNS {
            return Err(EngineError::Capacity(format!(
                "too many prepared transactions ({})",
                pending.len()
            )));
        }

        let created = now_micros();
        let mut wal = self.wal.lock();
        let wal_sequence = wal
            .append(WalOp::PrepareTxn {
                txn_id,
                source,
                target,
                assoc_type,
                strength,
                side,
                created,
            })
            .map_err(|e| {
                self.enter_read_only(&e);
                e
            })?;
        drop(wal);

        pending.insert(
            txn_id,
            PreparedAssociation {
                source,
                target,
                assoc_type,
                strength,
                side,
                created,
                wal_sequence,
            },
        );
        Ok(())
    }

    /// Apply the commit decision: log it and make the prepared
    /// mutation visible. Returns the commit record's WAL sequence.
    pub fn commit_txn(&self, txn_id: u64) -> Result<u64> {
        self.check_writable()?;

        let prepared = self
            .pending_prepared
            .lock()
            .remove(&txn_id)
            .ok_or_else(|| EngineError::NotFound(format!("prepared transaction {}", txn_id)))?;

        let record = AssociationRecord::new(
            prepared.source,
            prepared.target,
            prepared.assoc_type,
            prepared.strength,
            prepared.created,
        );

        let side = prepared.side;
        match self.log_mutation(WalOp::CommitTxn { txn_id }, |_| {
            WriteEntry::AddAssociation { record, side }
        }) {
            Ok(sequence) => Ok(sequence),
            Err(e) => {
                // Decision not recorded; the transaction stays prepared
                // so recovery or a retry can still resolve it.
                self.pending_prepared.lock().insert(txn_id, prepared);
                Err(e)
            }
        }
    }

    /// Apply the abort decision: the prepared mutation is dropped and
    /// never becomes visible.
    pub fn abort_txn(&self, txn_id: u64) -> Result<()> {
        self.check_writable()?;
        self.pending_prepared.lock().remove(&txn_id);

        let mut wal = self.wal.lock();
        wal.append(WalOp::AbortTxn { txn_id }).map_err(|e| {
            self.enter_read_only(&e);
            e
        })?;
        Ok(())
    }

    /// Transactions replayed from the WAL as prepared but undecided.
    /// The owner resolves these against the coordinator's decision log.
    pub fn undecided_txns(&self) -> Vec<u64> {
        self.pending_prepared.lock().keys().copied().collect()
    }

    // ========================
    // READ API
    // ========================

    pub fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.read_view.get_concept(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.read_view.contains(id)
    }

    pub fn get_neighbors(
        &self,
        id: ConceptId,
        filter: Option<AssociationType>,
    ) -> Vec<Neighbor> {
        self.index.neighbors(id, filter)
    }

    pub fn search_by_words(&self, words: &[String]) -> Vec<ConceptId> {
        self.index.search_by_words(words)
    }

    pub fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId> {
        self.index.query_at_time(timestamp)
    }

    pub fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId> {
        self.index.query_time_range(start, end)
    }

    /// All concepts carrying a semantic metadata block, for post-hoc
    /// contradiction queries
    pub fn semantic_concepts(&self) -> Vec<(ConceptId, SemanticMetadata)> {
        self.read_view
            .load()
            .concepts
            .values()
            .filter_map(|node| node.semantic.clone().map(|s| (node.id, s)))
            .collect()
    }

    /// Bounded breadth-first path search over the adjacency index
    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        if start == end {
            return Some(vec![start]);
        }

        let mut queue = VecDeque::new();
        let mut visited: HashMap<ConceptId, Option<ConceptId>> = HashMap::new();
        queue.push_back((start, 0usize));
        visited.insert(start, None);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for neighbor in self.index.neighbors(current, None) {
                if visited.contains_key(&neighbor.id) {
                    continue;
                }
                visited.insert(neighbor.id, Some(current));

                if neighbor.id == end {
                    let mut path = vec![end];
                    let mut cursor = current;
                    path.push(cursor);
                    while let Some(Some(previous)) = visited.get(&cursor) {
                        path.push(*previous);
                        cursor = *previous;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back((neighbor.id, depth + 1));
            }
        }

        None
    }

    /// k-NN vector search: HNSW first, linear scan over raw vectors
    /// when the graph comes up short or ids have degraded to fallback.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        if query.len() != self.config.vector_dimension {
            return Err(EngineError::Validation(format!(
                "query dimension mismatch: expected {}, got {}",
                self.config.vector_dimension,
                query.len()
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut normalized = query.to_vec();
        normalize(&mut normalized);

        let mut results = self.hnsw.search(&normalized, k);

        if results.len() < k {
            // The graph cannot satisfy k; exact scan is the answer.
            return self.vectors.linear_search(&normalized, k);
        }

        if !self.hnsw_fallback.is_empty() {
            let mut seen: HashSet<ConceptId> = results.iter().map(|(id, _)| *id).collect();
            for entry in self.hnsw_fallback.iter() {
                let id = *entry;
                if seen.contains(&id) {
                    continue;
                }
                if let Some(vector) = self.vectors.get(id) {
                    results.push((id, crate::vectors::cosine_distance(&normalized, &vector)));
                    seen.insert(id);
                }
            }
            results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
            results.truncate(k);
        }

        Ok(results)
    }

    /// Train the product quantizer over the stored vectors
    pub fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()> {
        self.vectors.train_quantizer(sample)
    }

    pub fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        self.hnsw.set_ef_search(ef_search)
    }

    // ========================
    // MAINTENANCE
    // ========================

    /// Force a reconcile, flush the snapshot to a level-0 segment,
    /// persist vectors and the HNSW graph, then truncate the WAL up to
    /// the durable point and fsync the manifest.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_writable()?;
        self.reconciler.reconcile_now();

        let snapshot = self.read_view.load();
        let result: Result<()> = (|| {
            let active_wal_file = self.wal.lock().active_file_id();
            if snapshot.concept_count() > 0
                || snapshot.edge_count() > 0
                || !snapshot.concept_tombstones.is_empty()
                || !snapshot.association_tombstones.is_empty()
            {
                self.lsm.flush_snapshot(&snapshot, active_wal_file)?;
            } else {
                self.lsm
                    .record_durable_point(snapshot.sequence, active_wal_file)?;
            }

            self.vectors.save()?;
            self.hnsw.save()?;
            {
                let manifest_handle = self.lsm.manifest();
                let mut manifest = manifest_handle.write();
                manifest.vector_descriptor = Some(VectorDescriptor {
                    dimension: self.config.vector_dimension,
                    num_subvectors: self.config.pq_subvectors,
                    num_centroids: self.config.pq_centroids,
                    quantizer_trained: self.vectors.quantizer_trained(),
                });
                manifest.hnsw_file = Some("hnsw.idx".into());
                let path = self.config.storage_path.join("manifest.json");
                manifest.save(path)?;
            }

            // Everything at or below the reconciled point is captured in
            // the segment; keep undecided prepared records in the log.
            if snapshot.sequence > 0 {
                let mut up_to = Some(snapshot.sequence - 1);
                if let Some(min_prepared) = self
                    .pending_prepared
                    .lock()
                    .values()
                    .map(|p| p.wal_sequence)
                    .min()
                {
                    up_to = match min_prepared {
                        0 => None,
                        n => up_to.map(|u| u.min(n - 1)),
                    };
                }
                if let Some(up_to) = up_to {
                    self.wal.lock().truncate(up_to)?;
                }
            }
            Ok(())
        })();

        if let Err(ref e) = result {
            self.enter_read_only(e);
        }
        result
    }

    /// Force the reconciler to fold everything pending right now
    pub fn reconcile_now(&self) -> usize {
        self.reconciler.reconcile_now()
    }

    /// Run one compaction pass immediately (admin surface; the
    /// background task does this on its own schedule)
    pub fn compact_now(&self) -> Result<bool> {
        self.lsm.compact_once()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn snapshot_sequence(&self) -> u64 {
        self.read_view.load().sequence
    }

    pub fn stats(&self) -> ConcurrentStats {
        let snapshot = self.read_view.load();
        let write_log = self.write_log.stats();
        ConcurrentStats {
            concepts: snapshot.concept_count(),
            edges: snapshot.edge_count(),
            vectors: self.vectors.len(),
            wal_appends: self.wal.lock().sequence(),
            wal_rejected: write_log.rejected,
            reconciliations: self.reconciler.stats().reconciliations,
            hnsw_fallbacks: self.hnsw_fallback_count.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            write_log,
            reconciler: self.reconciler.stats(),
            lsm: self.lsm.stats(),
            vector_store: self.vectors.stats(),
            hnsw: self.hnsw.stats(),
        }
    }
}

impl Drop for ConcurrentMemory {
    fn drop(&mut self) {
        self.reconciler.stop();
        self.lsm.stop_background_compaction();
    }
}

/// Fold one replayed WAL record into the recovering snapshot.
fn replay_record(
    snapshot: &mut crate::read_view::GraphSnapshot,
    index: &GraphIndex,
    pending: &mut HashMap<u64, PreparedAssociation>,
    reconciled: u64,
    record: crate::wal::WalRecord,
) {
    use crate::wal::WalRecord;

    let WalRecord { sequence, op, .. } = record;
    let already_captured = sequence < reconciled;

    match op {
        WalOp::WriteConcept {
            concept_id,
            content,
            vector,
            strength,
            confidence,
            semantic,
            modified,
            ..
        } => {
            if already_captured {
                return;
            }
            apply_entry(
                snapshot,
                index,
                &WriteEntry::AddConcept {
                    id: concept_id,
                    content: content.into_boxed_slice(),
                    vector: vector.map(Vec::into_boxed_slice),
                    strength,
                    confidence,
                    semantic,
                    timestamp: modified,
                },
            );
            snapshot.sequence = snapshot.sequence.max(sequence + 1);
        }
        WalOp::WriteAssociation {
            source,
            target,
            assoc_type,
            strength,
            side,
            created,
        } => {
            if already_captured {
                return;
            }
            let record = AssociationRecord::new(source, target, assoc_type, strength, created);
            apply_entry(
                snapshot,
                index,
                &WriteEntry::AddAssociation { record, side },
            );
            snapshot.sequence = snapshot.sequence.max(sequence + 1);
        }
        WalOp::DeleteConcept {
            concept_id,
            timestamp,
        } => {
            if already_captured {
                return;
            }
            apply_entry(
                snapshot,
                index,
                &WriteEntry::DeleteConcept {
                    id: concept_id,
                    timestamp,
                },
            );
            snapshot.sequence = snapshot.sequence.max(sequence + 1);
        }
        WalOp::DeleteAssociation {
            source,
            target,
            assoc_type,
            timestamp,
        } => {
            if already_captured {
                return;
            }
            apply_entry(
                snapshot,
                index,
                &WriteEntry::DeleteAssociation {
                    source,
                    target,
                    assoc_type: assoc_type as u8,
                    timestamp,
                },
            );
            snapshot.sequence = snapshot.sequence.max(sequence + 1);
        }
        WalOp::BeginTxn { .. } => {}
        WalOp::PrepareTxn {
            txn_id,
            source,
            target,
            assoc_type,
            strength,
            side,
            created,
        } => {
            pending.insert(
                txn_id,
                PreparedAssociation {
                    source,
                    target,
                    assoc_type,
                    strength,
                    side,
                    created,
                    wal_sequence: sequence,
                },
            );
        }
        WalOp::CommitTxn { txn_id } => {
            if let Some(prepared) = pending.remove(&txn_id) {
                if !already_captured {
                    let record = AssociationRecord::new(
                        prepared.source,
                        prepared.target,
                        prepared.assoc_type,
                        prepared.strength,
                        prepared.created,
                    );
                    apply_entry(
                        snapshot,
                        index,
                        &WriteEntry::AddAssociation {
                            record,
                            side: prepared.side,
                        },
                    );
                    snapshot.sequence = snapshot.sequence.max(sequence + 1);
                }
            }
        }
        WalOp::AbortTxn { txn_id } => {
            pending.remove(&txn_id);
        }
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
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path, dimension: usize) -> EngineConfig {
        EngineConfig {
            storage_path: dir.to_path_buf(),
            vector_dimension: dimension,
            pq_subvectors: dimension.min(4),
            pq_centroids: 16,
            ..Default::default()
        }
    }

    fn content_id(content: &[u8]) -> ConceptId {
        ConceptId::from_content(content)
    }

    #[test]
    fn test_learn_and_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let content = b"Humans are mammals.".to_vec();
        let id = content_id(&content);
        memory
            .learn_concept(id, content.clone(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9, None)
            .unwrap();

        memory.reconcile_now();

        let node = memory.get_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), content.as_slice());
        assert_eq!(node.strength, 1.0);

        let hits = memory.vector_search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id);
        assert!(hits[0].1 < 1e-5);
    }

    #[test]
    fn test_last_writer_wins_replacement() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let content = b"replaceable".to_vec();
        let id = content_id(&content);
        memory
            .learn_concept(id, content.clone(), None, 0.2, 0.5, None)
            .unwrap();
        memory
            .learn_concept(id, content.clone(), None, 0.9, 0.8, None)
            .unwrap();
        memory.reconcile_now();

        let node = memory.get_concept(&id).unwrap();
        assert_eq!(node.strength, 0.9);
        assert_eq!(node.confidence, 0.8);
        assert_eq!(memory.stats().concepts, 1);
    }

    #[test]
    fn test_association_both_directions() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let x = content_id(b"x");
        let y = content_id(b"y");
        memory
            .learn_association(x, y, AssociationType::Semantic, 1.0, EdgeSide::Both)
            .unwrap();
        memory.reconcile_now();

        let from_x = memory.get_neighbors(x, None);
        assert_eq!(from_x.len(), 1);
        assert_eq!(from_x[0].id, y);
        assert_eq!(from_x[0].strength, 1.0);

        let from_y = memory.get_neighbors(y, None);
        assert_eq!(from_y.len(), 1);
        assert_eq!(from_y[0].id, x);
    }

    #[test]
    fn test_crash_recovery_from_wal() {
        let dir = TempDir::new().unwrap();
        let a = content_id(b"A");
        let b = content_id(b"B");

        {
            let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
            memory.learn_concept(a, b"A".to_vec(), None, 1.0, 0.9, None).unwrap();
            memory.learn_concept(b, b"B".to_vec(), None, 1.0, 0.9, None).unwrap();
            // No checkpoint: dropping here is the crash.
        }

        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
        assert!(memory.get_concept(&a).is_some());
        assert!(memory.get_concept(&b).is_some());
        assert_eq!(memory.stats().wal_appends, 2);
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = TempDir::new().unwrap();
        let id = content_id(b"durable");

        {
            let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
            memory
                .learn_concept(id, b"durable".to_vec(), Some(vec![0.0, 1.0, 0.0, 0.0]), 1.0, 0.9, None)
                .unwrap();
            memory.checkpoint().unwrap();
        }

        // After restart the concept comes from the segment, not the WAL.
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
        let node = memory.get_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), b"durable");
        // The vector survived through the vector-store files.
        let hits = memory.vector_search(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, id);
    }

    #[test]
    fn test_delete_concept() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let id = content_id(b"doomed");
        memory
            .learn_concept(id, b"doomed".to_vec(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9, None)
            .unwrap();
        memory.reconcile_now();
        assert!(memory.contains(&id));

        memory.remove_concept(id).unwrap();
        memory.reconcile_now();

        assert!(!memory.contains(&id));
        let hits = memory.vector_search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert!(hits.iter().all(|(hit, _)| *hit != id));

        // Deleting an absent id is a no-op, not an error.
        memory.remove_concept(content_id(b"never existed")).unwrap();
    }

    #[test]
    fn test_deletion_survives_restart() {
        let dir = TempDir::new().unwrap();
        let id = content_id(b"gone for good");

        {
            let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
            memory.learn_concept(id, b"gone for good".to_vec(), None, 1.0, 0.9, None).unwrap();
            memory.checkpoint().unwrap();
            memory.remove_concept(id).unwrap();
            // Crash with the delete only in the WAL.
        }

        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
        assert!(!memory.contains(&id));
    }

    #[test]
    fn test_reinforce() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let id = content_id(b"reinforced");
        memory.learn_concept(id, b"reinforced".to_vec(), None, 0.5, 0.9, None).unwrap();
        memory.reinforce(id, 0.95).unwrap();
        memory.reconcile_now();

        assert_eq!(memory.get_concept(&id).unwrap().strength, 0.95);

        assert!(matches!(
            memory.reinforce(content_id(b"missing"), 0.5),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_word_and_time_queries() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let id = content_id(b"Rust is a systems language");
        memory
            .learn_concept(id, b"Rust is a systems language".to_vec(), None, 1.0, 0.9, None)
            .unwrap();
        memory.reconcile_now();

        assert_eq!(memory.search_by_words(&["rust".into()]), vec![id]);
        assert_eq!(
            memory.search_by_words(&["rust".into(), "systems".into()]),
            vec![id]
        );

        let node = memory.get_concept(&id).unwrap();
        assert_eq!(memory.query_at_time(node.created), vec![id]);
        assert_eq!(
            memory.query_time_range(node.created, node.created + 1),
            vec![id]
        );
    }

    #[test]
    fn test_find_path() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let a = content_id(b"a");
        let b = content_id(b"b");
        let c = content_id(b"c");
        memory
            .learn_association(a, b, AssociationType::Semantic, 0.8, EdgeSide::Both)
            .unwrap();
        memory
            .learn_association(b, c, AssociationType::Semantic, 0.8, EdgeSide::Both)
            .unwrap();
        memory.reconcile_now();

        let path = memory.find_path(a, c, 10).unwrap();
        assert_eq!(path, vec![a, b, c]);

        // Depth bound respected.
        assert!(memory.find_path(a, c, 1).is_none());
    }

    #[test]
    fn test_prepared_txn_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let x = content_id(b"x");
        let y = content_id(b"y");

        memory.begin_txn(7).unwrap();
        memory
            .prepare_association(7, x, y, AssociationType::Semantic, 1.0, EdgeSide::Forward)
            .unwrap();
        memory.reconcile_now();

        // Prepared but undecided: nothing visible.
        assert!(memory.get_neighbors(x, None).is_empty());

        memory.commit_txn(7).unwrap();
        memory.reconcile_now();

        let neighbors = memory.get_neighbors(x, None);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, y);
    }

    #[test]
    fn test_aborted_txn_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        let x = content_id(b"x");
        let y = content_id(b"y");

        memory.begin_txn(9).unwrap();
        memory
            .prepare_association(9, x, y, AssociationType::Semantic, 1.0, EdgeSide::Forward)
            .unwrap();
        memory.abort_txn(9).unwrap();
        memory.reconcile_now();

        assert!(memory.get_neighbors(x, None).is_empty());
        assert!(memory.undecided_txns().is_empty());
    }

    #[test]
    fn test_undecided_txn_surfaces_after_restart() {
        let dir = TempDir::new().unwrap();
        let x = content_id(b"x");
        let y = content_id(b"y");

        {
            let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
            memory.begin_txn(11).unwrap();
            memory
                .prepare_association(11, x, y, AssociationType::Semantic, 1.0, EdgeSide::Forward)
                .unwrap();
            // Crash before any decision.
        }

        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
        assert_eq!(memory.undecided_txns(), vec![11]);
        // Still invisible.
        assert!(memory.get_neighbors(x, None).is_empty());

        // The owner resolves it (no decision known → abort).
        memory.abort_txn(11).unwrap();
        assert!(memory.undecided_txns().is_empty());
    }

    #[test]
    fn test_committed_txn_survives_restart() {
        let dir = TempDir::new().unwrap();
        let x = content_id(b"x");
        let y = content_id(b"y");

        {
            let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
            memory.begin_txn(13).unwrap();
            memory
                .prepare_association(13, x, y, AssociationType::Semantic, 0.7, EdgeSide::Forward)
                .unwrap();
            memory.commit_txn(13).unwrap();
            // Crash after commit, before checkpoint.
        }

        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();
        let neighbors = memory.get_neighbors(x, None);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, y);
        assert!(memory.undecided_txns().is_empty());
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(config(dir.path(), 4)).unwrap();

        for i in 0..10u8 {
            let content = vec![i];
            memory
                .learn_concept(content_id(&content), content.clone(), None, 1.0, 0.9, None)
                .unwrap();
        }
        memory.reconcile_now();

        let stats = memory.stats();
        assert_eq!(stats.concepts, 10);
        assert_eq!(stats.wal_appends, 10);
        assert!(stats.reconciliations >= 1);
    }
}
