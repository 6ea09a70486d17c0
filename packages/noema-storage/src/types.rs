/// Core types for the Noema storage engine
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concept ID: 16-byte content hash
///
/// Derived deterministically from the concept's raw content bytes, so the
/// same content always maps to the same id. Opaque to callers apart from
/// equality and ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct ConceptId(pub [u8; 16]);

/// Association ID: per-shard monotonic 64-bit sequence
pub type AssociationId = u64;

impl ConceptId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Content-addressed identity: hash(content) -> id
    pub fn from_content(content: &[u8]) -> Self {
        let digest = md5::compute(content);
        Self(digest.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Some(Self(id))
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Association type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssociationType {
    Semantic = 0,
    Causal = 1,
    Temporal = 2,
    Hierarchical = 3,
    Compositional = 4,
}

impl AssociationType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Semantic),
            1 => Some(Self::Causal),
            2 => Some(Self::Temporal),
            3 => Some(Self::Hierarchical),
            4 => Some(Self::Compositional),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Causal => "causal",
            Self::Temporal => "temporal",
            Self::Hierarchical => "hierarchical",
            Self::Compositional => "compositional",
        }
    }
}

/// Record flag: the record is a deletion tombstone
pub const FLAG_TOMBSTONE: u32 = 1 << 0;
/// Record flag: the concept carries an embedding vector
pub const FLAG_HAS_VECTOR: u32 = 1 << 1;
/// Record flag: the concept carries a semantic metadata block
pub const FLAG_HAS_SEMANTIC: u32 = 1 << 2;

/// Fixed-size concept record (128 bytes)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)] // packed to avoid padding
pub struct ConceptRecord {
    pub concept_id: ConceptId,   // 16 bytes
    pub strength: f32,           // 4 bytes
    pub confidence: f32,         // 4 bytes
    pub flags: u32,              // 4 bytes
    pub created: u64,            // 8 bytes (microseconds)
    pub modified: u64,           // 8 bytes (microseconds)
    pub content_offset: u64,     // 8 bytes
    pub content_length: u32,     // 4 bytes
    pub vector_offset: u64,      // 8 bytes
    pub vector_length: u32,      // 4 bytes (dimension)
    pub semantic_offset: u64,    // 8 bytes
    pub semantic_length: u32,    // 4 bytes
    pub access_count: u32,       // 4 bytes
    pub reserved1: [u8; 32],     // 32 bytes
    pub reserved2: [u8; 12],     // 12 bytes to reach 128
} // Total: 128 bytes

impl ConceptRecord {
    pub fn new(id: ConceptId, created: u64, modified: u64) -> Self {
        Self {
            concept_id: id,
            strength: 1.0,
            confidence: 1.0,
            flags: 0,
            created,
            modified,
            content_offset: 0,
            content_length: 0,
            vector_offset: 0,
            vector_length: 0,
            semantic_offset: 0,
            semantic_length: 0,
            access_count: 0,
            reserved1: [0; 32],
            reserved2: [0; 12],
        }
    }

    /// Tombstone record for a deleted id; `modified` orders it against
    /// earlier live versions during compaction.
    pub fn tombstone(id: ConceptId, deleted_at: u64) -> Self {
        let mut record = Self::new(id, deleted_at, deleted_at);
        record.flags |= FLAG_TOMBSTONE;
        record
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    pub fn has_vector(&self) -> bool {
        self.flags & FLAG_HAS_VECTOR != 0
    }

    pub fn has_semantic(&self) -> bool {
        self.flags & FLAG_HAS_SEMANTIC != 0
    }
}

/// Fixed-size association record (64 bytes)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)] // packed to avoid padding
pub struct AssociationRecord {
    pub source_id: ConceptId, // 16 bytes
    pub target_id: ConceptId, // 16 bytes
    pub assoc_type: u8,       // 1 byte
    pub flags: u8,            // 1 byte
    pub strength: f32,        // 4 bytes
    pub created: u64,         // 8 bytes (microseconds)
    pub modified: u64,        // 8 bytes (microseconds)
    pub reserved: [u8; 10],   // 10 bytes padding to reach 64
} // Total: 64 bytes

/// Association flag: deletion tombstone
pub const ASSOC_FLAG_TOMBSTONE: u8 = 1 << 0;
/// Association flag: only the forward adjacency lives on this shard
pub const ASSOC_FLAG_FORWARD_ONLY: u8 = 1 << 1;
/// Association flag: only the inverse adjacency lives on this shard
pub const ASSOC_FLAG_INVERSE_ONLY: u8 = 1 << 2;

impl AssociationRecord {
    pub fn new(
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        strength: f32,
        created: u64,
    ) -> Self {
        Self {
            source_id: source,
            target_id: target,
            assoc_type: assoc_type as u8,
            flags: 0,
            strength,
            created,
            modified: created,
            reserved: [0; 10],
        }
    }

    pub fn tombstone(
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        deleted_at: u64,
    ) -> Self {
        let mut record = Self::new(source, target, assoc_type, 0.0, deleted_at);
        record.flags |= ASSOC_FLAG_TOMBSTONE;
        record
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & ASSOC_FLAG_TOMBSTONE != 0
    }

    pub fn association_type(&self) -> Option<AssociationType> {
        AssociationType::from_u8(self.assoc_type)
    }
}

/// One adjacency entry: a typed, weighted directed edge endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: ConceptId,
    pub assoc_type: AssociationType,
    pub strength: f32,
    pub created: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_record_size() {
        assert_eq!(std::mem::size_of::<ConceptRecord>(), 128);
    }

    #[test]
    fn test_association_record_size() {
        assert_eq!(std::mem::size_of::<AssociationRecord>(), 64);
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = ConceptId::from_content(b"Humans are mammals.");
        let b = ConceptId::from_content(b"Humans are mammals.");
        let c = ConceptId::from_content(b"Humans are mammals!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = ConceptId::from_content(b"round trip");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(ConceptId::from_hex(&hex), Some(id));
        assert_eq!(ConceptId::from_hex("zz"), None);
    }

    #[test]
    fn test_association_type_from_u8() {
        assert_eq!(AssociationType::from_u8(0), Some(AssociationType::Semantic));
        assert_eq!(
            AssociationType::from_u8(4),
            Some(AssociationType::Compositional)
        );
        assert_eq!(AssociationType::from_u8(5), None);
    }

    #[test]
    fn test_tombstone_flags() {
        let record = ConceptRecord::tombstone(ConceptId([1; 16]), 42);
        assert!(record.is_tombstone());
        assert!(!record.has_vector());

        let assoc = AssociationRecord::tombstone(
            ConceptId([1; 16]),
            ConceptId([2; 16]),
            AssociationType::Causal,
            42,
        );
        assert!(assoc.is_tombstone());
    }
}
