/// LSM organisation of segments with background compaction
///
/// Level 0 receives whole-snapshot flushes of the in-memory tail. When
/// a level accumulates enough segments the compactor merges them into
/// the next level (10× size factor between levels). Merging
/// deduplicates by id, highest modified timestamp winning; deletion
/// tombstones suppress older versions and are themselves dropped only
/// once the merge covers every remaining segment.
use crate::error::Result;
use crate::index::{ConceptLocation, GraphIndex};
use crate::manifest::{Manifest, SegmentMetadata};
use crate::read_view::{ConceptNode, EdgeKey, GraphSnapshot};
use crate::segment::{ConceptPayload, Segment, SegmentBuilder};
use crate::types::{
    AssociationRecord, AssociationType, ConceptId, ASSOC_FLAG_FORWARD_ONLY,
    ASSOC_FLAG_INVERSE_ONLY, FLAG_TOMBSTONE,
};
use crate::write_log::EdgeSide;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Segments per level that trigger a merge
    pub compaction_threshold: usize,
    /// Size factor between consecutive levels
    pub level_size_multiplier: u32,
    /// Segment flush ceiling (bytes)
    pub max_segment_size: u64,
    /// Background check interval (seconds)
    pub check_interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 4,
            level_size_multiplier: 10,
            max_segment_size: 64 * 1024 * 1024,
            check_interval_secs: 300,
        }
    }
}

/// LSM-tree statistics
#[derive(Debug, Clone)]
pub struct LsmStats {
    pub total_segments: usize,
    pub total_concept_records: u64,
    pub total_size: u64,
    pub level_counts: Vec<usize>,
    pub compaction_count: u64,
}

struct ConceptWinner {
    payload: ConceptPayload,
    modified: u64,
    tombstone: bool,
}

struct AssociationWinner {
    record: AssociationRecord,
    modified: u64,
    tombstone: bool,
}

/// Segment catalog plus compactor for one shard
pub struct LsmTree {
    segments_dir: PathBuf,
    manifest_path: PathBuf,
    manifest: Arc<RwLock<Manifest>>,
    segment_cache: Arc<DashMap<u32, Arc<Segment>>>,
    config: CompactionConfig,
    running: Arc<AtomicBool>,
    compactor_handle: Option<JoinHandle<()>>,
}

fn segment_file_name(level: u32, segment_id: u32) -> String {
    format!("{}-{:05}.seg", level, segment_id)
}

impl LsmTree {
    /// Open or create the tree under `root` (segments live in
    /// `root/segments`, the manifest at `root/manifest.json`).
    pub fn open<P: AsRef<Path>>(root: P, config: CompactionConfig) -> Result<Self> {
        let root = root.as_ref();
        let segments_dir = root.join("segments");
        std::fs::create_dir_all(&segments_dir)?;

        let manifest_path = root.join("manifest.json");
        let manifest = if manifest_path.exists() {
            Manifest::load(&manifest_path)?
        } else {
            let manifest = Manifest::new();
            manifest.save(&manifest_path)?;
            manifest
        };

        Ok(Self {
            segments_dir,
            manifest_path,
            manifest: Arc::new(RwLock::new(manifest)),
            segment_cache: Arc::new(DashMap::new()),
            config,
            running: Arc::new(AtomicBool::new(false)),
            compactor_handle: None,
        })
    }

    pub fn manifest(&self) -> Arc<RwLock<Manifest>> {
        Arc::clone(&self.manifest)
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        manifest.save(&self.manifest_path)
    }

    /// Persist the durable pointers without touching segments
    pub fn record_durable_point(&self, reconciled_sequence: u64, active_wal_file: u64) -> Result<()> {
        let mut manifest = self.manifest.write();
        manifest.last_reconciled_sequence = reconciled_sequence;
        manifest.active_wal_file = active_wal_file;
        self.save_manifest(&manifest)
    }

    /// Flush a snapshot to a new level-0 segment and advance the
    /// durable pointers in the manifest.
    pub fn flush_snapshot(
        &self,
        snapshot: &GraphSnapshot,
        active_wal_file: u64,
    ) -> Result<SegmentMetadata> {
        let mut manifest = self.manifest.write();
        let segment_id = manifest.allocate_segment_id();
        let file_name = segment_file_name(0, segment_id);
        let path = self.segments_dir.join(&file_name);

        let mut builder = SegmentBuilder::new(&path, segment_id, 0);

        for node in snapshot.concepts.values() {
            builder.add_concept(ConceptPayload {
                id: node.id,
                strength: node.strength,
                confidence: node.confidence,
                flags: 0,
                created: node.created,
                modified: node.modified,
                access_count: node.access_count,
                content: node.content.to_vec(),
                vector: node.vector.as_ref().map(|v| v.to_vec()),
                semantic: node.semantic.clone(),
            });
        }
        for (id, deleted_at) in snapshot.concept_tombstones.iter() {
            builder.add_concept(ConceptPayload {
                id: *id,
                strength: 0.0,
                confidence: 0.0,
                flags: FLAG_TOMBSTONE,
                created: *deleted_at,
                modified: *deleted_at,
                access_count: 0,
                content: Vec::new(),
                vector: None,
                semantic: None,
            });
        }

        for record in snapshot.associations.values() {
            builder.add_association(*record);
        }
        for ((source, target, assoc_type), deleted_at) in snapshot.association_tombstones.iter() {
            if let Some(t) = AssociationType::from_u8(*assoc_type) {
                builder.add_association(AssociationRecord::tombstone(
                    *source, *target, t, *deleted_at,
                ));
            }
        }

        let stats = builder.finish()?;

        manifest.add_segment(SegmentMetadata {
            segment_id,
            path: PathBuf::from(&file_name),
            level: 0,
            concept_count: stats.concept_count,
            association_count: stats.association_count,
            file_size: stats.file_size,
            min_key: stats.min_key,
            max_key: stats.max_key,
            created_at: current_timestamp_us(),
        });
        manifest.last_reconciled_sequence = snapshot.sequence;
        manifest.active_wal_file = active_wal_file;
        self.save_manifest(&manifest)?;

        Ok(manifest.segments[0].clone())
    }

    fn get_segment(&self, meta: &SegmentMetadata) -> Result<Arc<Segment>> {
        if let Some(segment) = self.segment_cache.get(&meta.segment_id) {
            return Ok(Arc::clone(&segment));
        }
        let segment = Arc::new(Segment::open(self.segments_dir.join(&meta.path))?);
        self.segment_cache
            .insert(meta.segment_id, Arc::clone(&segment));
        Ok(segment)
    }

    /// Rebuild the durable state from all segments: merged snapshot
    /// plus fully populated indexes. Newest modified timestamp wins per
    /// id; tombstones suppress older versions.
    pub fn load_state(&self, index: &GraphIndex) -> Result<GraphSnapshot> {
        let manifest = self.manifest.read();

        let mut concepts: HashMap<ConceptId, (ConceptWinner, u32, u64)> = HashMap::new();
        let mut associations: HashMap<EdgeKey, AssociationWinner> = HashMap::new();

        for meta in manifest.segments.iter() {
            let segment = self.get_segment(meta)?;

            for (offset, record) in segment.concepts_with_offsets() {
                let modified = record.modified;
                let replace = concepts
                    .get(&record.concept_id)
                    .map(|(winner, _, _)| modified > winner.modified)
                    .unwrap_or(true);
                if !replace {
                    continue;
                }
                let winner = ConceptWinner {
                    payload: ConceptPayload {
                        id: record.concept_id,
                        strength: record.strength,
                        confidence: record.confidence,
                        flags: record.flags,
                        created: record.created,
                        modified: record.modified,
                        access_count: record.access_count,
                        content: if record.is_tombstone() {
                            Vec::new()
                        } else {
                            segment.content(&record)?.to_vec()
                        },
                        vector: segment.vector(&record)?,
                        semantic: segment.semantic(&record)?,
                    },
                    modified,
                    tombstone: record.is_tombstone(),
                };
                concepts.insert(record.concept_id, (winner, meta.segment_id, offset));
            }

            for record in segment.associations() {
                let key = (record.source_id, record.target_id, record.assoc_type);
                let modified = record.modified;
                let replace = associations
                    .get(&key)
                    .map(|winner| modified > winner.modified)
                    .unwrap_or(true);
                if replace {
                    associations.insert(
                        key,
                        AssociationWinner {
                            record,
                            modified,
                            tombstone: record.is_tombstone(),
                        },
                    );
                }
            }
        }

        let mut snapshot = GraphSnapshot::new(manifest.last_reconciled_sequence);

        for (id, (winner, segment_id, offset)) in concepts {
            if winner.tombstone {
                snapshot.concept_tombstones.insert(id, winner.modified);
                continue;
            }
            let payload = winner.payload;
            let mut node = ConceptNode::new(
                id,
                payload.content,
                payload.vector,
                payload.strength,
                payload.confidence,
                payload.semantic,
                payload.created,
                payload.modified,
            );
            node.access_count = payload.access_count;

            index.insert_concept(
                id,
                ConceptLocation::Segment { segment_id, offset },
                payload.created,
            );
            index.index_content(id, &node.content);
            snapshot.concepts.insert(id, node);
        }

        for (key, winner) in associations {
            if winner.tombstone {
                snapshot.association_tombstones.insert(key, winner.modified);
                continue;
            }
            let record = winner.record;
            let side = if record.flags & ASSOC_FLAG_FORWARD_ONLY != 0 {
                EdgeSide::Forward
            } else if record.flags & ASSOC_FLAG_INVERSE_ONLY != 0 {
                EdgeSide::Inverse
            } else {
                EdgeSide::Both
            };
            index.add_edge(&record, side);
            snapshot.associations.insert(key, record);
        }

        Ok(snapshot)
    }

    /// Whether any level has accumulated enough segments to merge
    pub fn needs_compaction(&self) -> bool {
        let manifest = self.manifest.read();
        let max_level = manifest.max_level();
        (0..=max_level).any(|level| self.level_over_threshold(&manifest, level))
    }

    /// A level merges when it holds too many segments, or when its data
    /// outgrows the level's size budget (10× per level by default).
    fn level_over_threshold(&self, manifest: &Manifest, level: u32) -> bool {
        let segments = manifest.segments_at_level(level);
        if segments.len() >= self.config.compaction_threshold {
            return true;
        }
        let level_budget = self.config.max_segment_size
            * (self.config.level_size_multiplier as u64).pow(level);
        segments.len() > 1 && segments.iter().map(|s| s.file_size).sum::<u64>() > level_budget
    }

    /// Merge all segments of `level` into one segment at `level + 1`.
    pub fn compact_level(&self, level: u32) -> Result<usize> {
        let (input_metas, drop_tombstones, target_level) = {
            let manifest = self.manifest.read();
            let inputs: Vec<SegmentMetadata> = manifest
                .segments_at_level(level)
                .into_iter()
                .cloned()
                .collect();
            if inputs.is_empty() {
                return Ok(0);
            }
            // Tombstones may only disappear when no older segment can
            // resurrect the deleted id.
            let covers_everything = inputs.len() == manifest.segments.len();
            (inputs, covers_everything, level + 1)
        };

        let mut concepts: HashMap<ConceptId, ConceptWinner> = HashMap::new();
        let mut associations: HashMap<EdgeKey, AssociationWinner> = HashMap::new();

        for meta in &input_metas {
            let segment = self.get_segment(meta)?;

            for record in segment.concepts() {
                let modified = record.modified;
                let replace = concepts
                    .get(&record.concept_id)
                    .map(|winner| modified > winner.modified)
                    .unwrap_or(true);
                if !replace {
                    continue;
                }
                concepts.insert(
                    record.concept_id,
                    ConceptWinner {
                        payload: ConceptPayload {
                            id: record.concept_id,
                            strength: record.strength,
                            confidence: record.confidence,
                            flags: record.flags,
                            created: record.created,
                            modified: record.modified,
                            access_count: record.access_count,
                            content: if record.is_tombstone() {
                                Vec::new()
                            } else {
                                segment.content(&record)?.to_vec()
                            },
                            vector: segment.vector(&record)?,
                            semantic: segment.semantic(&record)?,
                        },
                        modified,
                        tombstone: record.is_tombstone(),
                    },
                );
            }

            for record in segment.associations() {
                let key = (record.source_id, record.target_id, record.assoc_type);
                let modified = record.modified;
                let replace = associations
                    .get(&key)
                    .map(|winner| modified > winner.modified)
                    .unwrap_or(true);
                if replace {
                    associations.insert(
                        key,
                        AssociationWinner {
                            record,
                            modified,
                            tombstone: record.is_tombstone(),
                        },
                    );
                }
            }
        }

        // Write the merged output.
        let mut manifest = self.manifest.write();
        let segment_id = manifest.allocate_segment_id();
        let file_name = segment_file_name(target_level, segment_id);
        let path = self.segments_dir.join(&file_name);

        let mut builder = SegmentBuilder::new(&path, segment_id, target_level);
        let mut surviving = 0usize;
        for winner in concepts.into_values() {
            if winner.tombstone && drop_tombstones {
                continue;
            }
            builder.add_concept(winner.payload);
            surviving += 1;
        }
        for winner in associations.into_values() {
            if winner.tombstone && drop_tombstones {
                continue;
            }
            builder.add_association(winner.record);
        }
        let stats = builder.finish()?;

        let input_ids: Vec<u32> = input_metas.iter().map(|m| m.segment_id).collect();
        manifest.add_segment(SegmentMetadata {
            segment_id,
            path: PathBuf::from(&file_name),
            level: target_level,
            concept_count: stats.concept_count,
            association_count: stats.association_count,
            file_size: stats.file_size,
            min_key: stats.min_key,
            max_key: stats.max_key,
            created_at: current_timestamp_us(),
        });
        manifest.remove_segments(&input_ids);
        manifest.record_compaction();
        self.save_manifest(&manifest)?;
        drop(manifest);

        // Inputs are unreachable now; drop the files.
        for meta in &input_metas {
            self.segment_cache.remove(&meta.segment_id);
            let path = self.segments_dir.join(&meta.path);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        log::info!(
            "compacted {} segment(s) from level {} into level {} ({} record(s) survive)",
            input_metas.len(),
            level,
            target_level,
            surviving
        );

        Ok(surviving)
    }

    /// One compaction pass: merge the first level over threshold.
    pub fn compact_once(&self) -> Result<bool> {
        let level = {
            let manifest = self.manifest.read();
            let max_level = manifest.max_level();
            (0..=max_level).find(|level| self.level_over_threshold(&manifest, *level))
        };
        match level {
            Some(level) => {
                self.compact_level(level)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start the background compaction task. Errors postpone compaction
    /// but never affect read availability.
    pub fn start_background_compaction(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let running = Arc::clone(&self.running);
        let manifest = Arc::clone(&self.manifest);
        let segment_cache = Arc::clone(&self.segment_cache);
        let segments_dir = self.segments_dir.clone();
        let manifest_path = self.manifest_path.clone();
        let config = self.config.clone();

        let handle = thread::spawn(move || {
            let tree = LsmTree {
                segments_dir,
                manifest_path,
                manifest,
                segment_cache,
                config: config.clone(),
                running: Arc::clone(&running),
                compactor_handle: None,
            };
            let mut backoff = 1u64;
            while running.load(Ordering::Relaxed) {
                // Sleep in short slices so stop() is responsive.
                let mut slept = 0;
                while slept < config.check_interval_secs * 1000 && running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(100));
                    slept += 100;
                }
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                match tree.compact_once() {
                    Ok(_) => backoff = 1,
                    Err(e) => {
                        log::error!("compaction failed (retrying in {}s): {}", backoff, e);
                        thread::sleep(Duration::from_secs(backoff));
                        backoff = (backoff * 2).min(60);
                    }
                }
            }
        });

        self.compactor_handle = Some(handle);
    }

    pub fn stop_background_compaction(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.compactor_handle.take() {
            handle.join().ok();
        }
    }

    pub fn stats(&self) -> LsmStats {
        let manifest = self.manifest.read();

        let max_level = manifest.max_level() as usize;
        let mut level_counts = vec![0usize; max_level + 1];
        for segment in &manifest.segments {
            level_counts[segment.level as usize] += 1;
        }

        LsmStats {
            total_segments: manifest.segments.len(),
            total_concept_records: manifest.total_concepts(),
            total_size: manifest.total_size(),
            level_counts,
            compaction_count: manifest.compaction_count,
        }
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        self.stop_background_compaction();
    }
}

fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}
