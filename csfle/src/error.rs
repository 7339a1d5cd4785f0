//! Error types for `csfle` operations.

use std::fmt;

/// Main error type for encryption engine operations.
///
/// Every variant is terminal for the operation that produced it: the state
/// machine never recovers internally and never returns a partially
/// transformed document alongside an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The markings service could not be reached or rejected the command
    #[error("markings service failed: {0}")]
    MarkingsServiceFailed(String),

    /// Fetching a collection's schema validator failed
    #[error("collection info lookup failed: {0}")]
    CollectionInfoFailed(String),

    /// No data key matched the requested id or alternate name
    #[error("data key not found: {0}")]
    KeyNotFound(String),

    /// The key vault query or insert failed
    #[error("key vault query failed: {0}")]
    KeyVaultQueryFailed(String),

    /// The remote KMS could not be reached
    #[error("KMS unreachable: {0}")]
    KmsUnreachable(String),

    /// The remote KMS rejected our credentials
    #[error("KMS authentication failed: {0}")]
    KmsAuthFailed(String),

    /// Data key material could not be unwrapped (or wrapped)
    #[error("data key unwrap failed: {0}")]
    UnwrapFailed(String),

    /// The field cipher could not be initialised
    #[error("cipher initialisation failed: {0}")]
    CipherInitFailed(String),

    /// The field cipher failed while producing output
    #[error("cipher finalisation failed: {0}")]
    CipherFinalizeFailed(String),

    /// Authentication tag verification failed (ciphertext corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// An intent-to-encrypt marking could not be parsed
    #[error("malformed marking: {0}")]
    MalformedMarking(String),

    /// An encrypted envelope could not be parsed
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An IV was missing or not exactly 16 bytes
    #[error("invalid IV: {0}")]
    InvalidIV(String),

    /// The envelope ciphertext was missing or of the wrong binary subtype
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Engine options are incomplete or inconsistent
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A caller supplied an argument the operation cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// BSON serialization failed
    #[error("BSON serialization failed: {0}")]
    BsonSerialization(#[from] bson::ser::Error),

    /// BSON deserialization failed
    #[error("BSON deserialization failed: {0}")]
    BsonDeserialization(#[from] bson::de::Error),
}

impl Error {
    /// Returns true when the error reports tampered or corrupt ciphertext.
    ///
    /// Kept distinct from envelope decode errors so callers can audit it.
    #[must_use]
    pub const fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }
}

/// Errors specific to remote KMS exchanges.
#[derive(Debug)]
pub enum KmsError {
    /// Connecting to, writing to, or reading from the KMS endpoint failed
    Unreachable(String),

    /// The KMS rejected the request signature or credentials
    AuthFailed(String),

    /// The KMS replied, but the reply was an error or failed validation
    UnwrapFailed(String),

    /// Wrapping a new data key failed
    WrapFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(msg) => write!(f, "KMS unreachable: {msg}"),
            Self::AuthFailed(msg) => write!(f, "KMS authentication failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<KmsError> for Error {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::Unreachable(msg) => Self::KmsUnreachable(msg),
            KmsError::Io(err) => Self::KmsUnreachable(err.to_string()),
            KmsError::AuthFailed(msg) => Self::KmsAuthFailed(msg),
            KmsError::UnwrapFailed(msg) | KmsError::WrapFailed(msg) => Self::UnwrapFailed(msg),
        }
    }
}
