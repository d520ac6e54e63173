use thiserror::Error;

/// Error kinds for the rebuild core.
///
/// The split between `NotANode` and `NodeCorrupt` matters to the scanner:
/// a stray sector that never looked like a node is skipped silently, while
/// a block with a valid fsid but a bad checksum is worth a warning and a
/// bad-node record.
#[derive(Debug, Error)]
pub enum RebuildError {
    /// sector did not look like a node (no magic / header UUID mismatch)
    #[error("not a node: {0}")]
    NotANode(String),

    /// magic matched but checksum or self-laddr failed
    #[error("node corrupt: {0}")]
    NodeCorrupt(String),

    /// node parsed but did not match caller's expectations
    #[error("node {field} mismatch: expected {expected}, found {actual}")]
    ExpectationMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// chunk/dev-extent add failed the overlap rules
    #[error("mapping conflict: {0}")]
    MappingConflict(String),

    /// tree lookup miss
    #[error("no such item")]
    NoItem,

    /// two surviving records disagree about the filesystem
    #[error("filesystem inconsistency: {0}")]
    FsInconsistency(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl RebuildError {
    /// Io and Cancelled abort the rebuild; everything else is warned and
    /// worked around.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RebuildError::Io(_) | RebuildError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, RebuildError>;
