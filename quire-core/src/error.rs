//! Errors raised by the transform engine and document model.

/// Engine errors.
///
/// Both variants are caller bugs: the engine never repairs its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// Primitive offsets fall outside the base document, or two operations
    /// do not describe the same base document.
    MalformedOperation(String),
    /// The operations (or operation and document) disagree on the base revision.
    BaseRevisionMismatch { expected: u64, found: u64 },
}

impl OtError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        OtError::MalformedOperation(reason.into())
    }
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::MalformedOperation(e) => write!(f, "Malformed operation: {e}"),
            OtError::BaseRevisionMismatch { expected, found } => {
                write!(f, "Base revision mismatch: expected {expected}, got {found}")
            }
        }
    }
}

impl std::error::Error for OtError {}
