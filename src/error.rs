use thiserror::Error;

/// Why a session token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Missing,
    Malformed,
    TooLarge,
    PayloadTooLarge,
    BadSignature,
    Expired,
    BadVersion,
    ParseError,
}

impl TokenRejection {
    /// Short reason code sent back to the observer.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRejection::Missing => "missing-token",
            TokenRejection::Malformed => "malformed-token",
            TokenRejection::TooLarge => "token-too-large",
            TokenRejection::PayloadTooLarge => "payload-too-large",
            TokenRejection::BadSignature => "bad-signature",
            TokenRejection::Expired => "expired",
            TokenRejection::BadVersion => "invalid-version",
            TokenRejection::ParseError => "parse-error",
        }
    }
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which connection ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    Global,
    Subject,
    AllProcessSubscribers,
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityScope::Global => write!(f, "global"),
            CapacityScope::Subject => write!(f, "subject"),
            CapacityScope::AllProcessSubscribers => write!(f, "all-process subscribers"),
        }
    }
}

/// Main error type for the fleet warden
#[derive(Debug, Error)]
pub enum WardenError {
    // Process manager adapter errors
    #[error("Process manager call '{op}' timed out for {target}")]
    AdapterTimeout { op: &'static str, target: String },

    #[error("Process manager call '{op}' failed: {message}")]
    AdapterCallFailed { op: &'static str, message: String },

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already exists: {0}")]
    ProcessAlreadyExists(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Bus errors
    #[error("process-not-allowed: {0}")]
    ProcessNotAllowed(String),

    #[error("Subscribe failed: {0}")]
    SubscriptionFailed(String),

    // Session admission errors
    #[error("Unauthorized: {0}")]
    InvalidToken(TokenRejection),

    #[error("Invalid subject")]
    InvalidSubject,

    #[error("Forbidden origin")]
    OriginRejected,

    #[error("Too Many Requests")]
    RateLimited,

    #[error("Capacity reached ({0})")]
    CapacityExceeded(CapacityScope),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Watchdog errors
    #[error("Failed to delete escalated process {0}: {1}")]
    EscalationDeleteFailed(String, String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// HTTP-style status used when an admission failure is surfaced to an observer.
    pub fn status_code(&self) -> u16 {
        match self {
            WardenError::OriginRejected
            | WardenError::Forbidden(_)
            | WardenError::ProcessNotAllowed(_) => 403,
            WardenError::InvalidToken(_) => 401,
            WardenError::CapacityExceeded(CapacityScope::Subject) | WardenError::RateLimited => 429,
            WardenError::CapacityExceeded(_) => 503,
            WardenError::InvalidSubject | WardenError::SubscriptionFailed(_) => 400,
            WardenError::ProcessNotFound(_) => 404,
            WardenError::AdapterTimeout { .. } => 504,
            _ => 500,
        }
    }

    pub(crate) fn call_failed(op: &'static str, err: impl std::fmt::Display) -> Self {
        WardenError::AdapterCallFailed {
            op,
            message: err.to_string(),
        }
    }
}

/// Result type alias for fleet warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
