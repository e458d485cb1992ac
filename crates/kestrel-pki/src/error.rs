//! PKI errors

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Supplied PEM, key or certificate could not be parsed
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// A generation task panicked or was cancelled
    #[error("PKI task failed: {0}")]
    TaskFailed(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

impl From<PkiError> for kestrel_common::Error {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::ParseError(reason) => {
                kestrel_common::Error::model_invalid("properties.certificateProfile", reason)
            }
            other => kestrel_common::Error::internal(other.to_string()),
        }
    }
}
