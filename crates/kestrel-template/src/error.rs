//! Template errors

use thiserror::Error;

/// Template errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Template is not shaped as expected
    #[error("template malformed at {location}: {reason}")]
    Malformed { location: String, reason: String },
}

impl TransformError {
    pub fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for template operations
pub type Result<T> = std::result::Result<T, TransformError>;

impl From<TransformError> for kestrel_common::Error {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Malformed { location, reason } => {
                kestrel_common::Error::template_malformed(location, reason)
            }
        }
    }
}
