/// Engine error taxonomy
///
/// Errors are values with one distinct variant per failure kind; callers
/// match on the variant, never on message strings. `FatalIo` and
/// `CorruptState` flip the affected shard into read-only mode.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: over-sized content, wrong vector dimension,
    /// unknown enum value, out-of-range parameter.
    #[error("validation error: {0}")]
    Validation(String),

    /// Write log full beyond the backpressure window, or too many
    /// prepared transactions in flight.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// WAL fsync or manifest rename failed. Fatal for the shard.
    #[error("fatal I/O error: {0}")]
    FatalIo(String),

    /// Lookup for an id the caller expected to exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two-phase commit timed out or a participant failed prepare.
    #[error("transaction {0} aborted: {1}")]
    TransactionAborted(u64, String),

    /// Segment checksum mismatch or manifest parse failure. Fatal for
    /// the shard.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// External collaborator (embedding service) failed; the write
    /// itself still succeeds without a vector.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Whether this error shuts the shard down for writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalIo(_) | Self::CorruptState(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::FatalIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::FatalIo("fsync".into()).is_fatal());
        assert!(EngineError::CorruptState("bad checksum".into()).is_fatal());
        assert!(!EngineError::Validation("dim".into()).is_fatal());
        assert!(!EngineError::Capacity("full".into()).is_fatal());
        assert!(!EngineError::TransactionAborted(7, "timeout".into()).is_fatal());
    }
}
