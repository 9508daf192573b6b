//! # Error Handling
//!
//! Error types for the serving certificate signer, defined with `thiserror`.
//!
//! The variants follow how each failure is handled by the controllers:
//!
//! - Construction errors (`Template`, `Signing`, `UnsupportedKeyType`,
//!   `InvalidIdentity`) are fatal to the current reconciliation attempt and are
//!   never retried with the same input.
//! - `MalformedInput` on stored material means "reissue", not failure.
//! - `Persistence` and `Conflict` are transient and retried with backoff.
//! - `RotationConflict` is an expected race outcome and is swallowed.

/// Custom result type for signer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the serving certificate signer
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Certificate template is internally inconsistent
    #[error("Template error: {0}")]
    Template(String),

    /// Signing a certificate failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Input bytes are not well-formed PEM/DER
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Key algorithm other than RSA or ECDSA P-256
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Service identity is missing a namespace or name
    #[error("Invalid service identity: {0}")]
    InvalidIdentity(String),

    /// Durable store call failed or timed out
    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A store write lost a compare-and-swap race
    #[error("Resource conflict: {resource}")]
    Conflict { resource: String },

    /// Resource does not exist in the store
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Another rotation attempt already owns the CA state record
    #[error("CA rotation already in progress (generation {generation})")]
    RotationConflict { generation: u64 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new template error
    pub fn template<S: Into<String>>(message: S) -> Self {
        Self::Template(message.into())
    }

    /// Create a new signing error
    pub fn signing<S: Into<String>>(message: S) -> Self {
        Self::Signing(message.into())
    }

    /// Create a new malformed input error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedInput(message.into())
    }

    /// Create a new unsupported key type error
    pub fn unsupported_key<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedKeyType(message.into())
    }

    /// Create a new invalid identity error
    pub fn invalid_identity<S: Into<String>>(message: S) -> Self {
        Self::InvalidIdentity(message.into())
    }

    /// Create a persistence error without a source
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence { message: message.into(), source: None }
    }

    /// Create a persistence error with source
    pub fn persistence_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Persistence { message: message.into(), source: Some(source) }
    }

    /// Create a conflict error for a store resource
    pub fn conflict<S: Into<String>>(resource: S) -> Self {
        Self::Conflict { resource: resource.into() }
    }

    /// Create a not found error for a store resource
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Transient failures that should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::Conflict { .. })
    }

    /// Store-level failures worth retrying in place. Conflicts are excluded:
    /// a lost compare-and-swap has to be re-evaluated, not replayed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }

    /// Expected race outcomes that are not failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::RotationConflict { .. })
    }

    /// Programming or configuration errors. Logged and surfaced, never retried
    /// with the same input.
    pub fn is_fatal_to_attempt(&self) -> bool {
        matches!(
            self,
            Self::Template(_)
                | Self::Signing(_)
                | Self::UnsupportedKeyType(_)
                | Self::InvalidIdentity(_)
                | Self::Config(_)
        )
    }

    /// Short label used for metrics and status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Template(_) => "template",
            Self::Signing(_) => "signing",
            Self::MalformedInput(_) => "malformed_input",
            Self::UnsupportedKeyType(_) => "unsupported_key_type",
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::Persistence { .. } => "persistence",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::RotationConflict { .. } => "rotation_conflict",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Config(errors.to_string())
    }
}
