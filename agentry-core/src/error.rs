//! Error types for the Agentry engine core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering identity, model provider, tool, vault, ingestion, and store
//! domains. `ErrorKind` collapses the full tree into the wire-level taxonomy
//! the HTTP surface maps onto status codes.

/// Top-level error type for the engine core.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Insufficient credits: need {required}, have {balance}")]
    InsufficientCredits { required: i64, balance: i64 },

    #[error("Misconfigured: {message}")]
    Misconfigured { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from identity verification and tenant binding.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Token verification failed")]
    InvalidToken,

    #[error("Unsupported token algorithm: {alg}")]
    UnsupportedAlgorithm { alg: String },

    #[error("JWKS fetch failed: {message}")]
    JwksFetch { message: String },

    #[error("No verification key for kid {kid}")]
    KeyNotFound { kid: String },

    #[error("Not a member of the requested team")]
    NotMember,

    #[error("Requires {required} role or above")]
    RoleRequired { required: String },
}

/// Errors from LLM, embedding, and transcription providers.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("No provider available for model '{logical_id}'")]
    ProviderUnavailable { logical_id: String },

    #[error("Provider request failed: {message}")]
    Request { message: String, retryable: bool },

    #[error("Provider response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

impl ModelError {
    /// Whether a fresh attempt against the same provider may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Request { retryable, .. } => *retryable,
            ModelError::RateLimited { .. } | ModelError::Timeout { .. } => true,
            ModelError::ProviderUnavailable { .. } | ModelError::ResponseParse { .. } => false,
        }
    }
}

/// Errors from tool registration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool '{name}' execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Permission denied for tool '{name}': {reason}")]
    PermissionDenied { name: String, reason: String },

    #[error("Action '{name}' was rejected by a reviewer")]
    Rejected { name: String },
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Ciphertext format not recognized")]
    InvalidFormat,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Encryption failed: {0}")]
    EncryptFailed(String),
}

/// Errors from the knowledge-base ingest pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unsupported document format: {ext}")]
    UnsupportedFormat { ext: String },

    #[error("File content does not match declared {expected} format")]
    MagicMismatch { expected: String },

    #[error("Document too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Parse failed: {message}")]
    Parse { message: String },

    #[error("Embedding failed: {message}")]
    Embedding { message: String },
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Data corruption: {message}")]
    Corrupt { message: String },
}

/// The wire-level error taxonomy. Each engine error collapses to exactly one
/// kind; the HTTP layer maps kinds to status codes and machine codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    InvalidInput,
    Conflict,
    RateLimited,
    Provider,
    InsufficientCredits,
    Misconfigured,
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Conflict => 423,
            ErrorKind::RateLimited => 429,
            ErrorKind::Provider => 502,
            ErrorKind::InsufficientCredits => 402,
            ErrorKind::Misconfigured => 500,
            ErrorKind::Internal => 500,
        }
    }

    /// Stable machine code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Provider => "provider_error",
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::Misconfigured => "misconfigured",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    /// Collapse this error into the wire-level taxonomy.
    ///
    /// Ownership failures are already converted to `NotFound` at the query
    /// layer, so nothing here leaks existence across tenants.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Auth(e) => match e {
                AuthError::NotMember | AuthError::RoleRequired { .. } => ErrorKind::Forbidden,
                _ => ErrorKind::Unauthenticated,
            },
            EngineError::Model(e) => match e {
                ModelError::RateLimited { .. } => ErrorKind::RateLimited,
                _ => ErrorKind::Provider,
            },
            EngineError::Tool(e) => match e {
                ToolError::NotFound { .. } => ErrorKind::NotFound,
                ToolError::InvalidArguments { .. } => ErrorKind::InvalidInput,
                ToolError::PermissionDenied { .. } | ToolError::Rejected { .. } => {
                    ErrorKind::Forbidden
                }
                _ => ErrorKind::Internal,
            },
            EngineError::Vault(_) => ErrorKind::InvalidInput,
            EngineError::Ingest(e) => match e {
                IngestError::Embedding { .. } => ErrorKind::Provider,
                _ => ErrorKind::InvalidInput,
            },
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Forbidden { .. } => ErrorKind::Forbidden,
            EngineError::InvalidInput { .. } => ErrorKind::InvalidInput,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::RateLimited { .. } => ErrorKind::RateLimited,
            EngineError::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            EngineError::Misconfigured { .. } => ErrorKind::Misconfigured,
            EngineError::Store(_)
            | EngineError::Internal { .. }
            | EngineError::Io(_)
            | EngineError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Convenience constructor for ownership/lookup misses.
    pub fn not_found(entity: &'static str) -> Self {
        EngineError::NotFound { entity }
    }

    /// Convenience constructor for validation failures.
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            message: message.into(),
        }
    }

    /// Convenience constructor for access violations.
    pub fn forbidden(message: impl Into<String>) -> Self {
        EngineError::Forbidden {
            message: message.into(),
        }
    }

    /// Convenience constructor for internal failures.
    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Store(StoreError::Database(e))
    }
}

/// A type alias for results using the top-level `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_auth() {
        let err = EngineError::Auth(AuthError::KeyNotFound {
            kid: "abc123".into(),
        });
        assert_eq!(err.to_string(), "Auth error: No verification key for kid abc123");
    }

    #[test]
    fn test_error_display_model() {
        let err = EngineError::Model(ModelError::ProviderUnavailable {
            logical_id: "fast".into(),
        });
        assert_eq!(
            err.to_string(),
            "Model error: No provider available for model 'fast'"
        );
    }

    #[test]
    fn test_error_display_credits() {
        let err = EngineError::InsufficientCredits {
            required: 3,
            balance: 1,
        };
        assert_eq!(err.to_string(), "Insufficient credits: need 3, have 1");
    }

    #[test]
    fn test_ownership_miss_is_not_found() {
        let err = EngineError::not_found("agent");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.kind().status(), 404);
        assert_eq!(err.to_string(), "agent not found");
    }

    #[test]
    fn test_kind_mapping_auth() {
        let unauthed = EngineError::Auth(AuthError::InvalidToken);
        assert_eq!(unauthed.kind(), ErrorKind::Unauthenticated);
        assert_eq!(unauthed.kind().status(), 401);

        let forbidden = EngineError::Auth(AuthError::RoleRequired {
            required: "admin".into(),
        });
        assert_eq!(forbidden.kind(), ErrorKind::Forbidden);
        assert_eq!(forbidden.kind().status(), 403);
    }

    #[test]
    fn test_kind_mapping_provider() {
        let err = EngineError::Model(ModelError::Request {
            message: "503".into(),
            retryable: true,
        });
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(err.kind().status(), 502);

        let limited = EngineError::Model(ModelError::RateLimited {
            retry_after_secs: 10,
        });
        assert_eq!(limited.kind().status(), 429);
    }

    #[test]
    fn test_kind_mapping_conflict_and_credits() {
        let locked = EngineError::Conflict {
            message: "locked by agent a1".into(),
        };
        assert_eq!(locked.kind().status(), 423);

        let credits = EngineError::InsufficientCredits {
            required: 5,
            balance: 0,
        };
        assert_eq!(credits.kind().status(), 402);
        assert_eq!(credits.kind().code(), "insufficient_credits");
    }

    #[test]
    fn test_model_error_retryable() {
        assert!(ModelError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(
            ModelError::Request {
                message: "500".into(),
                retryable: true
            }
            .is_retryable()
        );
        assert!(
            !ModelError::Request {
                message: "400".into(),
                retryable: false
            }
            .is_retryable()
        );
        assert!(
            !ModelError::ProviderUnavailable {
                logical_id: "x".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_tool_rejected_is_forbidden() {
        let err = EngineError::Tool(ToolError::Rejected {
            name: "send_external_email".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
