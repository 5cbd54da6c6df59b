use thiserror::Error;

/// A single problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Unified error type for the counter service.
#[derive(Error, Debug, Clone)]
pub enum CounterError {
    /// No shards are registered in the hash ring
    #[error("Hash ring is empty: no shards registered")]
    RingEmpty,

    /// The ring routed a key to a shard the pool holds no client for
    #[error("Shard {0} is in the hash ring but missing from the pool")]
    ShardMissingFromPool(String),

    /// Connection failure, timeout or open circuit breaker
    #[error("Store unavailable on shard {shard}: {reason}")]
    StoreUnavailable { shard: String, reason: String },

    /// The store answered, but with an error or a reply we cannot use
    #[error("Store error on shard {shard}: {message}")]
    StoreError { shard: String, message: String },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Validation error with every issue found
    #[error("Validation error: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    ValidationError(Vec<ValidationIssue>),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Parse/serialization error
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl CounterError {
    pub fn store_unavailable(shard: impl Into<String>, reason: impl ToString) -> Self {
        CounterError::StoreUnavailable {
            shard: shard.into(),
            reason: reason.to_string(),
        }
    }

    pub fn store_error(shard: impl Into<String>, message: impl ToString) -> Self {
        CounterError::StoreError {
            shard: shard.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is transient and the operation may be retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, CounterError::StoreUnavailable { .. })
    }

    /// Check if this error signals misconfiguration or a broken invariant
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CounterError::RingEmpty | CounterError::ShardMissingFromPool(_)
        )
    }

    /// Check if this error came from talking to a shard
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            CounterError::StoreUnavailable { .. } | CounterError::StoreError { .. }
        )
    }
}

// === Conversion Implementations ===

macro_rules! impl_from_error {
    ($err_type:ty, $arm:pat => $body:expr) => {
        impl From<$err_type> for CounterError {
            fn from(err: $err_type) -> Self {
                match err {
                    $arm => $body,
                }
            }
        }
    };
}

impl_from_error!(std::io::Error, e => match e.kind() {
    std::io::ErrorKind::InvalidInput => CounterError::InvalidArgument(e.to_string()),
    _ => CounterError::IoError(e.to_string()),
});

impl_from_error!(serde_json::Error, e => CounterError::ParseError(e.to_string()));
impl_from_error!(toml::de::Error, e => CounterError::ParseError(e.to_string()));

/// Result type alias for operations that can fail with CounterError.
pub type CounterResult<T> = Result<T, CounterError>;
