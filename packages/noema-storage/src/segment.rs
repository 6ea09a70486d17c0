/// Immutable segment files with memory-mapped reads
///
/// File Format:
/// ┌─────────────────┬──────────────┬─────────────────┬───────────────────┐
/// │ SegmentHeader   │ Concept[]    │ Association[]   │ Payload region    │
/// │ (256 bytes)     │ (128B each)  │ (64B each)      │ (variable, LE)    │
/// └─────────────────┴──────────────┴─────────────────┴───────────────────┘
///
/// The payload region holds length-prefixed content bytes, vectors and
/// semantic blocks referenced by offset from the concept records. Files
/// are written once by the builder, fsynced, and only ever read through
/// an mmap afterwards.
use crate::error::{EngineError, Result};
use crate::semantic::SemanticMetadata;
use crate::types::{AssociationRecord, ConceptId, ConceptRecord, FLAG_HAS_SEMANTIC, FLAG_HAS_VECTOR};
use bytemuck::{cast_slice, from_bytes, Pod, Zeroable};
use crc32fast::Hasher as Crc32;
use memmap2::{Mmap, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes identifying Noema segment files
const MAGIC_BYTES: [u8; 8] = *b"NOEMASEG";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 256;

const CONCEPT_RECORD_SIZE: usize = std::mem::size_of::<ConceptRecord>();
const ASSOCIATION_RECORD_SIZE: usize = std::mem::size_of::<AssociationRecord>();

/// Segment file header (256 bytes)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SegmentHeader {
    pub magic: [u8; 8],            // 8 bytes
    pub version: u32,              // 4 bytes
    pub segment_id: u32,           // 4 bytes
    pub level: u32,                // 4 bytes

    pub concept_offset: u64,       // 8 bytes
    pub concept_count: u32,        // 4 bytes
    pub association_offset: u64,   // 8 bytes
    pub association_count: u32,    // 4 bytes
    pub payload_offset: u64,       // 8 bytes
    pub payload_length: u64,       // 8 bytes

    pub created_at: u64,           // 8 bytes

    pub concept_checksum: u32,     // 4 bytes
    pub association_checksum: u32, // 4 bytes
    pub payload_checksum: u32,     // 4 bytes

    // Bounding key range over concept ids
    pub min_key: [u8; 16],         // 16 bytes
    pub max_key: [u8; 16],         // 16 bytes

    pub reserved1: [u8; 32],
    pub reserved2: [u8; 32],
    pub reserved3: [u8; 32],
    pub reserved4: [u8; 32],
    pub reserved5: [u8; 16],
} // Total: 256 bytes

impl SegmentHeader {
    fn new(segment_id: u32, level: u32) -> Self {
        Self {
            magic: MAGIC_BYTES,
            version: VERSION,
            segment_id,
            level,
            concept_offset: HEADER_SIZE as u64,
            concept_count: 0,
            association_offset: HEADER_SIZE as u64,
            association_count: 0,
            payload_offset: HEADER_SIZE as u64,
            payload_length: 0,
            created_at: current_timestamp_us(),
            concept_checksum: 0,
            association_checksum: 0,
            payload_checksum: 0,
            min_key: [0xFF; 16],
            max_key: [0x00; 16],
            reserved1: [0; 32],
            reserved2: [0; 32],
            reserved3: [0; 32],
            reserved4: [0; 32],
            reserved5: [0; 16],
        }
    }

    pub fn validate(&self) -> Result<()> {
        let version = self.version;
        if self.magic != MAGIC_BYTES {
            return Err(EngineError::CorruptState("invalid segment magic".into()));
        }
        if version != VERSION {
            return Err(EngineError::CorruptState(format!(
                "unsupported segment version: {}",
                version
            )));
        }
        Ok(())
    }
}

/// One concept staged for a segment, payloads included
#[derive(Debug, Clone)]
pub struct ConceptPayload {
    pub id: ConceptId,
    pub strength: f32,
    pub confidence: f32,
    pub flags: u32,
    pub created: u64,
    pub modified: u64,
    pub access_count: u32,
    pub content: Vec<u8>,
    pub vector: Option<Vec<f32>>,
    pub semantic: Option<SemanticMetadata>,
}

/// Single-pass writer producing a sealed segment file
pub struct SegmentBuilder {
    path: PathBuf,
    segment_id: u32,
    level: u32,
    concepts: Vec<ConceptPayload>,
    associations: Vec<AssociationRecord>,
}

impl SegmentBuilder {
    pub fn new<P: AsRef<Path>>(path: P, segment_id: u32, level: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            segment_id,
            level,
            concepts: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn add_concept(&mut self, concept: ConceptPayload) {
        self.concepts.push(concept);
    }

    pub fn add_association(&mut self, record: AssociationRecord) {
        self.associations.push(record);
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    /// Write the segment, fsync it, and return its stats. The header is
    /// written last so a crashed build never validates.
    pub fn finish(mut self) -> Result<SegmentStats> {
        let mut header = SegmentHeader::new(self.segment_id, self.level);

        // Deterministic record order within a segment
        self.concepts.sort_by_key(|c| c.id);
        self.associations
            .sort_by_key(|a| (a.source_id, a.target_id, a.assoc_type));

        let concept_offset = HEADER_SIZE as u64;
        let association_offset =
            concept_offset + (self.concepts.len() * CONCEPT_RECORD_SIZE) as u64;
        let payload_offset =
            association_offset + (self.associations.len() * ASSOCIATION_RECORD_SIZE) as u64;

        // Lay out the payload region and patch record offsets.
        let mut payload: Vec<u8> = Vec::new();
        let mut records = Vec::with_capacity(self.concepts.len());
        for concept in &self.concepts {
            let mut record = ConceptRecord::new(concept.id, concept.created, concept.modified);
            record.strength = concept.strength;
            record.confidence = concept.confidence;
            record.flags = concept.flags;
            record.access_count = concept.access_count;

            record.content_offset = payload_offset + payload.len() as u64;
            record.content_length = concept.content.len() as u32;
            payload.extend_from_slice(&(concept.content.len() as u32).to_le_bytes());
            payload.extend_from_slice(&concept.content);

            if let Some(ref vector) = concept.vector {
                record.flags |= FLAG_HAS_VECTOR;
                record.vector_offset = payload_offset + payload.len() as u64;
                record.vector_length = vector.len() as u32;
                payload.extend_from_slice(&(vector.len() as u32).to_le_bytes());
                payload.extend_from_slice(cast_slice(vector));
            }

            if let Some(ref semantic) = concept.semantic {
                let bytes = rmp_serde::to_vec(semantic)
                    .map_err(|e| EngineError::FatalIo(format!("semantic encode: {}", e)))?;
                record.flags |= FLAG_HAS_SEMANTIC;
                record.semantic_offset = payload_offset + payload.len() as u64;
                record.semantic_length = bytes.len() as u32;
                payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                payload.extend_from_slice(&bytes);
            }

            if concept.id.0 < header.min_key {
                header.min_key = concept.id.0;
            }
            if concept.id.0 > header.max_key {
                header.max_key = concept.id.0;
            }

            records.push(record);
        }

        let concept_bytes: &[u8] = cast_slice(&records);
        let association_bytes: &[u8] = cast_slice(&self.associations);

        header.concept_offset = concept_offset;
        header.concept_count = records.len() as u32;
        header.association_offset = association_offset;
        header.association_count = self.associations.len() as u32;
        header.payload_offset = payload_offset;
        header.payload_length = payload.len() as u64;
        header.concept_checksum = crc32(concept_bytes);
        header.association_checksum = crc32(association_bytes);
        header.payload_checksum = crc32(&payload);

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);

        // Placeholder header first; real one after the data is down.
        writer.write_all(&[0u8; HEADER_SIZE])?;
        writer.write_all(concept_bytes)?;
        writer.write_all(association_bytes)?;
        writer.write_all(&payload)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(bytemuck::bytes_of(&header))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let file_size = HEADER_SIZE as u64
            + concept_bytes.len() as u64
            + association_bytes.len() as u64
            + payload.len() as u64;

        Ok(SegmentStats {
            segment_id: self.segment_id,
            level: self.level,
            concept_count: header.concept_count,
            association_count: header.association_count,
            file_size,
            min_key: header.min_key,
            max_key: header.max_key,
        })
    }
}

/// Read-only, memory-mapped segment
pub struct Segment {
    path: PathBuf,
    header: SegmentHeader,
    mmap: Arc<Mmap>,
}

impl Segment {
    /// Open and fully validate a sealed segment
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| EngineError::CorruptState(format!("mmap failed: {}", e)))?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(EngineError::CorruptState("segment file too small".into()));
        }

        let header: SegmentHeader = *from_bytes(&mmap[0..HEADER_SIZE]);
        header.validate()?;

        let segment = Self {
            path,
            header,
            mmap: Arc::new(mmap),
        };
        segment.verify_checksums()?;

        Ok(segment)
    }

    fn verify_checksums(&self) -> Result<()> {
        let header = &self.header;
        let concept_end = header.concept_offset as usize
            + header.concept_count as usize * CONCEPT_RECORD_SIZE;
        let association_end = header.association_offset as usize
            + header.association_count as usize * ASSOCIATION_RECORD_SIZE;
        let payload_end = header.payload_offset as usize + header.payload_length as usize;

        if concept_end > self.mmap.len()
            || association_end > self.mmap.len()
            || payload_end > self.mmap.len()
        {
            return Err(EngineError::CorruptState(
                "segment regions exceed file size".into(),
            ));
        }

        let concepts = &self.mmap[header.concept_offset as usize..concept_end];
        let associations = &self.mmap[header.association_offset as usize..association_end];
        let payload = &self.mmap[header.payload_offset as usize..payload_end];

        let (c, a, p) = (
            header.concept_checksum,
            header.association_checksum,
            header.payload_checksum,
        );
        if crc32(concepts) != c || crc32(associations) != a || crc32(payload) != p {
            return Err(EngineError::CorruptState(format!(
                "segment {} checksum mismatch",
                { header.segment_id }
            )));
        }
        Ok(())
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn segment_id(&self) -> u32 {
        self.header.segment_id
    }

    pub fn level(&self) -> u32 {
        self.header.level
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterate over all concept records
    pub fn concepts(&self) -> ConceptIterator {
        let start = self.header.concept_offset as usize;
        ConceptIterator {
            mmap: Arc::clone(&self.mmap),
            offset: start,
            end: start + self.header.concept_count as usize * CONCEPT_RECORD_SIZE,
        }
    }

    /// Iterate over concept records with their absolute byte offsets
    /// (for the concept index)
    pub fn concepts_with_offsets(&self) -> impl Iterator<Item = (u64, ConceptRecord)> {
        let start = self.header.concept_offset;
        self.concepts()
            .enumerate()
            .map(move |(i, record)| (start + (i * CONCEPT_RECORD_SIZE) as u64, record))
    }

    /// Iterate over all association records
    pub fn associations(&self) -> AssociationIterator {
        let start = self.header.association_offset as usize;
        AssociationIterator {
            mmap: Arc::clone(&self.mmap),
            offset: start,
            end: start + self.header.association_count as usize * ASSOCIATION_RECORD_SIZE,
        }
    }

    /// Concept record at an absolute byte offset (from the concept index)
    pub fn concept_at(&self, offset: u64) -> Result<ConceptRecord> {
        let start = offset as usize;
        let end = start + CONCEPT_RECORD_SIZE;
        if start < HEADER_SIZE || end > self.mmap.len() {
            return Err(EngineError::CorruptState("record offset out of bounds".into()));
        }
        Ok(*from_bytes(&self.mmap[start..end]))
    }

    fn payload_slice(&self, offset: u64, expected_len: u32) -> Result<&[u8]> {
        let start = offset as usize;
        if start + 4 > self.mmap.len() {
            return Err(EngineError::CorruptState("payload offset out of bounds".into()));
        }
        let len = u32::from_le_bytes(self.mmap[start..start + 4].try_into().unwrap());
        if len != expected_len {
            return Err(EngineError::CorruptState(
                "payload length prefix mismatch".into(),
            ));
        }
        let data_start = start + 4;
        let data_end = data_start + len as usize;
        if data_end > self.mmap.len() {
            return Err(EngineError::CorruptState("payload exceeds segment".into()));
        }
        Ok(&self.mmap[data_start..data_end])
    }

    /// Content bytes for a record (zero-copy view of the mmap)
    pub fn content(&self, record: &ConceptRecord) -> Result<&[u8]> {
        self.payload_slice(record.content_offset, record.content_length)
    }

    /// Embedding vector for a record, if present
    pub fn vector(&self, record: &ConceptRecord) -> Result<Option<Vec<f32>>> {
        if !record.has_vector() {
            return Ok(None);
        }
        let start = record.vector_offset as usize;
        if start + 4 > self.mmap.len() {
            return Err(EngineError::CorruptState("vector offset out of bounds".into()));
        }
        let dim = u32::from_le_bytes(self.mmap[start..start + 4].try_into().unwrap());
        if dim != record.vector_length {
            return Err(EngineError::CorruptState("vector length mismatch".into()));
        }
        let data_start = start + 4;
        let data_end = data_start + dim as usize * 4;
        if data_end > self.mmap.len() {
            return Err(EngineError::CorruptState("vector exceeds segment".into()));
        }
        // The payload region is unaligned; decode per component.
        let floats = self.mmap[data_start..data_end]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        Ok(Some(floats))
    }

    /// Semantic metadata block for a record, if present
    pub fn semantic(&self, record: &ConceptRecord) -> Result<Option<SemanticMetadata>> {
        if !record.has_semantic() {
            return Ok(None);
        }
        let bytes = self.payload_slice(record.semantic_offset, record.semantic_length)?;
        let semantic = rmp_serde::from_slice(bytes)
            .map_err(|e| EngineError::CorruptState(format!("semantic decode: {}", e)))?;
        Ok(Some(semantic))
    }

    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            segment_id: self.header.segment_id,
            level: self.header.level,
            concept_count: self.header.concept_count,
            association_count: self.header.association_count,
            file_size: self.mmap.len() as u64,
            min_key: self.header.min_key,
            max_key: self.header.max_key,
        }
    }
}

/// Iterator over concept records in a segment
pub struct ConceptIterator {
    mmap: Arc<Mmap>,
    offset: usize,
    end: usize,
}

impl Iterator for ConceptIterator {
    type Item = ConceptRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let record = from_bytes::<ConceptRecord>(&self.mmap[self.offset..self.offset + CONCEPT_RECORD_SIZE]);
        self.offset += CONCEPT_RECORD_SIZE;
        Some(*record)
    }
}

/// Iterator over association records in a segment
pub struct AssociationIterator {
    mmap: Arc<Mmap>,
    offset: usize,
    end: usize,
}

impl Iterator for AssociationIterator {
    type Item = AssociationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let record =
            from_bytes::<AssociationRecord>(&self.mmap[self.offset..self.offset + ASSOCIATION_RECORD_SIZE]);
        self.offset += ASSOCIATION_RECORD_SIZE;
        Some(*record)
    }
}

/// Segment statistics
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub segment_id: u32,
    pub level: u32,
    pub concept_count: u32,
    pub association_count: u32,
    pub file_size: u64,
    pub min_key: [u8; 16],
    pub max_key: [u8; 16],
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}
