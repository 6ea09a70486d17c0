/// Sharded storage: N independent shards plus the 2PC coordinator
///
/// Every concept lives on exactly one shard, chosen by
/// `hash64(id) % N` with N fixed at construction. Concept operations
/// route to the owning shard. Associations whose endpoints share a
/// shard are a single WAL append there; cross-shard associations run
/// the two-phase protocol so that after any crash either both shards
/// reflect the edge or neither does.
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::memory::{ConcurrentMemory, ConcurrentStats};
use crate::read_view::ConceptNode;
use crate::semantic::SemanticMetadata;
use crate::transaction::{TransactionCoordinator, TxnDecision};
use crate::types::{AssociationType, ConceptId, Neighbor};
use crate::write_log::EdgeSide;
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

/// Multi-shard storage with cross-shard atomicity
pub struct ShardedStorage {
    config: EngineConfig,
    shards: Vec<Arc<ConcurrentMemory>>,
    coordinator: TransactionCoordinator,
}

impl ShardedStorage {
    /// Open all shards, then resolve any transactions left prepared by
    /// a crash against the coordinator's decision log. A transaction
    /// with no recorded decision aborts.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_path)?;

        let mut shards = Vec::with_capacity(config.num_shards as usize);
        for shard_id in 0..config.num_shards {
            let shard = ConcurrentMemory::open(config.for_shard(shard_id))?;
            shards.push(Arc::new(shard));
        }

        let coordinator =
            TransactionCoordinator::open(config.storage_path.join("txn"), config.txn_timeout)?;

        for (shard_id, shard) in shards.iter().enumerate() {
            for txn_id in shard.undecided_txns() {
                match coordinator.decision_for(txn_id) {
                    Some(TxnDecision::Commit) => {
                        log::info!(
                            "recovery: committing prepared txn {} on shard {}",
                            txn_id,
                            shard_id
                        );
                        shard.commit_txn(txn_id)?;
                    }
                    Some(TxnDecision::Abort) | None => {
                        log::info!(
                            "recovery: aborting prepared txn {} on shard {}",
                            txn_id,
                            shard_id
                        );
                        shard.abort_txn(txn_id)?;
                    }
                }
            }
        }

        Ok(Self {
            config,
            shards,
            coordinator,
        })
    }

    pub fn num_shards(&self) -> u32 {
        self.config.num_shards
    }

    /// Routing function: hash64(id) mod N
    pub fn shard_id_for(&self, id: ConceptId) -> u32 {
        let mut hasher = DefaultHasher::new();
        id.0.hash(&mut hasher);
        (hasher.finish() % self.config.num_shards as u64) as u32
    }

    fn shard_for(&self, id: ConceptId) -> &Arc<ConcurrentMemory> {
        &self.shards[self.shard_id_for(id) as usize]
    }

    /// Shard handle, for tests injecting per-shard faults
    pub fn shard(&self, shard_id: u32) -> &Arc<ConcurrentMemory> {
        &self.shards[shard_id as usize]
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    // ========================
    // ROUTED OPERATIONS
    // ========================

    pub fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticMetadata>,
    ) -> Result<u64> {
        self.shard_for(id)
            .learn_concept(id, content, vector, strength, confidence, semantic)
    }

    /// Store an association. Same-shard endpoints take the single-WAL
    /// fast path; cross-shard endpoints go through two-phase commit.
    pub fn add_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64> {
        let source_shard = self.shard_id_for(source);
        let target_shard = self.shard_id_for(target);

        if source_shard == target_shard {
            return self.shards[source_shard as usize].learn_association(
                source,
                target,
                assoc_type,
                strength,
                EdgeSide::Both,
            );
        }

        self.cross_shard_association(
            source,
            target,
            source_shard,
            target_shard,
            assoc_type,
            strength,
        )
    }

    fn cross_shard_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        source_shard: u32,
        target_shard: u32,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64> {
        let txn_id = self.coordinator.begin(vec![source_shard, target_shard]);
        let result = self.run_two_phase(
            txn_id,
            source,
            target,
            source_shard,
            target_shard,
            assoc_type,
            strength,
        );
        self.coordinator.complete(txn_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_two_phase(
        &self,
        txn_id: u64,
        source: ConceptId,
        target: ConceptId,
        source_shard: u32,
        target_shard: u32,
        assoc_type: AssociationType,
        strength: f32,
    ) -> Result<u64> {
        let src = &self.shards[source_shard as usize];
        let dst = &self.shards[target_shard as usize];
        let deadline = Instant::now() + self.coordinator.timeout();

        // Phase 0: both shards record the transaction start.
        src.begin_txn(txn_id)?;
        dst.begin_txn(txn_id)?;

        // Phase 1: prepare. The source shard holds the forward edge,
        // the target shard the inverse.
        let prepare = (|| -> Result<()> {
            src.prepare_association(txn_id, source, target, assoc_type, strength, EdgeSide::Forward)?;
            self.coordinator.mark_prepared(txn_id, source_shard)?;

            if Instant::now() > deadline {
                return Err(EngineError::TransactionAborted(
                    txn_id,
                    "prepare deadline exceeded".into(),
                ));
            }

            dst.prepare_association(txn_id, source, target, assoc_type, strength, EdgeSide::Inverse)?;
            self.coordinator.mark_prepared(txn_id, target_shard)?;
            Ok(())
        })();

        if let Err(cause) = prepare {
            self.coordinator.record_decision(txn_id, TxnDecision::Abort)?;
            if let Err(e) = src.abort_txn(txn_id) {
                log::error!("abort of txn {} failed on source shard: {}", txn_id, e);
            }
            if let Err(e) = dst.abort_txn(txn_id) {
                log::error!("abort of txn {} failed on target shard: {}", txn_id, e);
            }
            return Err(EngineError::TransactionAborted(txn_id, cause.to_string()));
        }

        // Phase 2: the durable decision record is the commit point.
        self.coordinator.record_decision(txn_id, TxnDecision::Commit)?;

        // A shard failing here recovers from the decision log: the
        // prepared record plus the Commit decision replay to a commit.
        let sequence = src.commit_txn(txn_id).map_err(|e| {
            log::error!("commit of txn {} pending on source shard: {}", txn_id, e);
            e
        })?;
        dst.commit_txn(txn_id).map_err(|e| {
            log::error!("commit of txn {} pending on target shard: {}", txn_id, e);
            e
        })?;

        Ok(sequence)
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.shard_for(*id).get_concept(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.shard_for(*id).contains(id)
    }

    pub fn get_neighbors(&self, id: ConceptId, filter: Option<AssociationType>) -> Vec<Neighbor> {
        self.shard_for(id).get_neighbors(id, filter)
    }

    pub fn remove_concept(&self, id: ConceptId) -> Result<u64> {
        self.shard_for(id).remove_concept(id)
    }

    /// Remove an association; a cross-shard edge is removed from both
    /// sides independently (deletes are idempotent tombstones).
    pub fn remove_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
    ) -> Result<u64> {
        let source_shard = self.shard_id_for(source);
        let target_shard = self.shard_id_for(target);

        let sequence =
            self.shards[source_shard as usize].remove_association(source, target, assoc_type)?;
        if target_shard != source_shard {
            self.shards[target_shard as usize].remove_association(source, target, assoc_type)?;
        }
        Ok(sequence)
    }

    pub fn reinforce(&self, id: ConceptId, strength: f32) -> Result<u64> {
        self.shard_for(id).reinforce(id, strength)
    }

    pub fn record_access(&self, id: ConceptId) {
        self.shard_for(id).record_access(id)
    }

    // ========================
    // FAN-OUT OPERATIONS
    // ========================

    /// Word search across every shard (union of per-shard results)
    pub fn search_by_words(&self, words: &[String]) -> Vec<ConceptId> {
        let mut ids: Vec<ConceptId> = self
            .shards
            .par_iter()
            .flat_map(|shard| shard.search_by_words(words))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn query_at_time(&self, timestamp: u64) -> Vec<ConceptId> {
        let mut ids: Vec<ConceptId> = self
            .shards
            .par_iter()
            .flat_map(|shard| shard.query_at_time(timestamp))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn query_time_range(&self, start: u64, end: u64) -> Vec<ConceptId> {
        let mut ids: Vec<ConceptId> = self
            .shards
            .par_iter()
            .flat_map(|shard| shard.query_time_range(start, end))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// k-NN across all shards: query each in parallel, merge the
    /// per-shard top-k lists.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        let per_shard: Vec<Result<Vec<(ConceptId, f32)>>> = self
            .shards
            .par_iter()
            .map(|shard| shard.vector_search(query, k))
            .collect();

        let mut merged = Vec::new();
        for result in per_shard {
            merged.extend(result?);
        }
        merged.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        merged.truncate(k);
        Ok(merged)
    }

    /// Breadth-first path search routed across shards
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
            for neighbor in self.get_neighbors(current, None) {
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

    pub fn semantic_concepts(&self) -> Vec<(ConceptId, SemanticMetadata)> {
        self.shards
            .par_iter()
            .flat_map(|shard| shard.semantic_concepts())
            .collect()
    }

    pub fn train_quantizer(&self, sample: Option<&[Vec<f32>]>) -> Result<()> {
        for shard in &self.shards {
            shard.train_quantizer(sample)?;
        }
        Ok(())
    }

    pub fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        for shard in &self.shards {
            shard.set_ef_search(ef_search)?;
        }
        Ok(())
    }

    /// Checkpoint every shard in parallel
    pub fn checkpoint(&self) -> Result<()> {
        self.shards
            .par_iter()
            .map(|shard| shard.checkpoint())
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    pub fn reconcile_now(&self) {
        for shard in &self.shards {
            shard.reconcile_now();
        }
    }

    pub fn shard_stats(&self) -> Vec<ConcurrentStats> {
        self.shards.iter().map(|shard| shard.stats()).collect()
    }
}
