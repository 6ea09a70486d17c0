//! Property-based round-trip laws

use noema_storage::{
    ConceptId, ConcurrentMemory, EngineConfig, FsyncPolicy, ProductQuantizer, WalOp, WriteAheadLog,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn wal_concept_op(content: Vec<u8>, strength: f32, confidence: f32) -> WalOp {
    WalOp::WriteConcept {
        concept_id: ConceptId::from_content(&content),
        content,
        vector: None,
        strength,
        confidence,
        semantic: None,
        created: 1_000,
        modified: 1_000,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Replaying a clean WAL yields the appended operations, in order.
    #[test]
    fn wal_replay_round_trip(
        contents in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..256),
            1..20,
        ),
        strength in 0.0f32..=1.0,
    ) {
        let dir = TempDir::new().unwrap();
        let mut wal =
            WriteAheadLog::open(dir.path(), FsyncPolicy::Always, 64 * 1024 * 1024).unwrap();

        let ops: Vec<WalOp> = contents
            .into_iter()
            .map(|content| wal_concept_op(content, strength, 0.9))
            .collect();
        for op in &ops {
            wal.append(op.clone()).unwrap();
        }
        drop(wal);

        let mut replayed = Vec::new();
        let stats = WriteAheadLog::replay(dir.path(), |record| replayed.push(record)).unwrap();

        prop_assert!(!stats.truncated);
        prop_assert_eq!(replayed.len(), ops.len());
        for (i, record) in replayed.iter().enumerate() {
            prop_assert_eq!(record.sequence, i as u64);
            prop_assert_eq!(&record.op, &ops[i]);
        }
    }

    /// Content hashing is deterministic and 16 bytes wide.
    #[test]
    fn concept_id_deterministic(content in proptest::collection::vec(any::<u8>(), 1..512)) {
        let a = ConceptId::from_content(&content);
        let b = ConceptId::from_content(&content);
        prop_assert_eq!(a, b);
        prop_assert_eq!(a.to_hex().len(), 32);
        prop_assert_eq!(ConceptId::from_hex(&a.to_hex()), Some(a));
    }

    /// encode → decode → re-encode is idempotent for a trained
    /// quantizer, and encode is deterministic.
    #[test]
    fn quantizer_recode_idempotent(seed in 0u64..1_000) {
        let mut quantizer = ProductQuantizer::new(16, 4, 8).unwrap();

        let mut state = seed.max(1);
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 40) as f32 / (1u64 << 24) as f32
        };
        let sample: Vec<Vec<f32>> = (0..32)
            .map(|_| (0..16).map(|_| next()).collect())
            .collect();
        quantizer.train(&sample).unwrap();

        for vector in &sample {
            let codes = quantizer.encode(vector).unwrap();
            prop_assert_eq!(&codes, &quantizer.encode(vector).unwrap());
            let decoded = quantizer.decode(&codes).unwrap();
            let recoded = quantizer.encode(&decoded).unwrap();
            prop_assert_eq!(codes, recoded);
        }
    }
}

/// Write → read returns the same bytes through the full engine stack.
#[test]
fn write_read_returns_same_bytes() {
    let dir = TempDir::new().unwrap();
    let memory = ConcurrentMemory::open(EngineConfig {
        storage_path: dir.path().to_path_buf(),
        vector_dimension: 4,
        pq_subvectors: 4,
        pq_centroids: 16,
        ..Default::default()
    })
    .unwrap();

    let payloads: Vec<Vec<u8>> = vec![
        b"plain ascii".to_vec(),
        "unicode: \u{00e9}\u{4e16}\u{754c}".as_bytes().to_vec(),
        vec![0u8, 255, 1, 254, 2, 253],
        vec![0x42; 4096],
    ];

    for content in &payloads {
        let id = ConceptId::from_content(content);
        memory
            .learn_concept(id, content.clone(), None, 1.0, 0.9, None)
            .unwrap();
    }
    memory.reconcile_now();

    for content in &payloads {
        let id = ConceptId::from_content(content);
        let node = memory.get_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), content.as_slice());
    }
}
