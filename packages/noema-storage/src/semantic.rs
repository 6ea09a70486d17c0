/// Semantic metadata types
///
/// Produced by the external classifier and persisted verbatim. The engine
/// stores and indexes these blocks but never interprets them beyond
/// filtering on the closed enumerations. Unknown discriminants are
/// rejected at the boundary, not ignored.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::ConceptId;

/// Primary semantic classification of a concept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SemanticTag {
    Rule = 0,
    Event = 1,
    Entity = 2,
    Temporal = 3,
    Causal = 4,
    Condition = 5,
    Negation = 6,
    Quantitative = 7,
    Definitional = 8,
    Unknown = 9,
}

impl SemanticTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Rule),
            1 => Some(Self::Event),
            2 => Some(Self::Entity),
            3 => Some(Self::Temporal),
            4 => Some(Self::Causal),
            5 => Some(Self::Condition),
            6 => Some(Self::Negation),
            7 => Some(Self::Quantitative),
            8 => Some(Self::Definitional),
            9 => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Event => "event",
            Self::Entity => "entity",
            Self::Temporal => "temporal",
            Self::Causal => "causal",
            Self::Condition => "condition",
            Self::Negation => "negation",
            Self::Quantitative => "quantitative",
            Self::Definitional => "definitional",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SemanticTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain the concept belongs to (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DomainTag {
    Medical = 0,
    Legal = 1,
    Financial = 2,
    Technical = 3,
    Scientific = 4,
    Business = 5,
    Unknown = 6,
}

impl DomainTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Medical),
            1 => Some(Self::Legal),
            2 => Some(Self::Financial),
            3 => Some(Self::Technical),
            4 => Some(Self::Scientific),
            5 => Some(Self::Business),
            6 => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Medical => "medical",
            Self::Legal => "legal",
            Self::Financial => "financial",
            Self::Technical => "technical",
            Self::Scientific => "scientific",
            Self::Business => "business",
            Self::Unknown => "unknown",
        }
    }
}

/// How a temporal bound relates to its timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TemporalKind {
    At = 0,
    Before = 1,
    After = 2,
    Interval = 3,
    Imprecise = 4,
}

/// Temporal validity of a concept
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalBounds {
    /// Start timestamp (microseconds), None = unbounded start
    pub start: Option<u64>,
    /// End timestamp (microseconds), None = unbounded end
    pub end: Option<u64>,
    pub kind: TemporalKind,
    pub confidence: f32,
}

impl TemporalBounds {
    pub fn new(start: Option<u64>, end: Option<u64>, kind: TemporalKind, confidence: f32) -> Self {
        Self {
            start,
            end,
            kind,
            confidence,
        }
    }

    /// Check if this bound contains a timestamp
    pub fn contains(&self, timestamp: u64) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => timestamp >= start && timestamp <= end,
            (Some(start), None) => timestamp >= start,
            (None, Some(end)) => timestamp <= end,
            (None, None) => true,
        }
    }

    /// Check if this bound overlaps another
    pub fn overlaps(&self, other: &TemporalBounds) -> bool {
        match (self.start, self.end, other.start, other.end) {
            (Some(s1), Some(e1), Some(s2), Some(e2)) => s1 <= e2 && s2 <= e1,
            _ => true, // unbounded sides always overlap
        }
    }
}

/// Kind of causal link between a cause and an effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CausalKind {
    Direct = 0,
    Enabling = 1,
    Inhibiting = 2,
}

/// One extracted causal relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalRelation {
    pub cause: String,
    pub effect: String,
    pub kind: CausalKind,
    pub confidence: f32,
}

/// Kind of negation expressed by a concept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NegationKind {
    Explicit = 0,
    Exception = 1,
    Contradiction = 2,
}

/// Negation scope
///
/// `negated_concept_ids` is reserved: it is persisted but never populated
/// by the engine, and no links are inferred from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegationScope {
    pub negated_concept_ids: Vec<ConceptId>,
    pub kind: NegationKind,
    pub confidence: f32,
}

impl NegationScope {
    pub fn new(kind: NegationKind, confidence: f32) -> Self {
        Self {
            negated_concept_ids: Vec::new(),
            kind,
            confidence,
        }
    }
}

/// Complete semantic metadata block for a concept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMetadata {
    pub tag: SemanticTag,
    pub domain: Option<DomainTag>,
    pub temporal_bounds: Option<TemporalBounds>,
    pub causal_relations: Vec<CausalRelation>,
    pub negation_scope: Option<NegationScope>,
    /// Confidence in the overall classification (0.0 - 1.0)
    pub classification_confidence: f32,
}

impl SemanticMetadata {
    pub fn new(tag: SemanticTag) -> Self {
        Self {
            tag,
            domain: None,
            temporal_bounds: None,
            causal_relations: Vec::new(),
            negation_scope: None,
            classification_confidence: 1.0,
        }
    }

    /// Check if this concept is valid at a given timestamp
    pub fn is_valid_at(&self, timestamp: u64) -> bool {
        self.temporal_bounds
            .as_ref()
            .map(|bounds| bounds.contains(timestamp))
            .unwrap_or(true)
    }

    /// Post-hoc contradiction test against another concept's metadata.
    ///
    /// Detects explicit Contradiction negations and rules in the same
    /// domain whose temporal bounds overlap. Never consulted at write
    /// time; contradictions are detectable, not blocked.
    pub fn conflicts_with(&self, other: &SemanticMetadata) -> bool {
        if let Some(ref negation) = self.negation_scope {
            if negation.kind == NegationKind::Contradiction {
                return true;
            }
        }

        if self.tag == SemanticTag::Rule
            && other.tag == SemanticTag::Rule
            && self.domain.is_some()
            && self.domain == other.domain
        {
            if let (Some(ref t1), Some(ref t2)) = (&self.temporal_bounds, &other.temporal_bounds) {
                return t1.overlaps(t2);
            }
        }

        false
    }
}
