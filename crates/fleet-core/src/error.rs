//! Error handling for gpufleet
//!
//! Provides a unified error type and result type for use across all gpufleet
//! components. Errors carry a category that maps onto the controller's
//! retry semantics: transient external failures are requeued, configuration
//! errors are surfaced on object status, invariant violations abort the
//! reconcile, and admission failures fail open.

/// Result type alias for gpufleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for gpufleet
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors (bad policy field, unknown pool name)
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Cluster runtime (API server) errors
    #[error("Cluster runtime error: {0}")]
    ClusterRuntime(String),

    /// Cloud capacity-control errors
    #[error("Cloud provider error: {0}")]
    Cloud(String),

    /// Metrics read-model errors
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Time-series store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Pricing lookup errors
    #[error("Pricing error: {0}")]
    Pricing(String),

    /// Alert channel delivery errors
    #[error("Alert error: {0}")]
    Alert(String),

    /// Admission-time rewrite errors (always fail open)
    #[error("Admission error: {0}")]
    Admission(String),

    /// A controller invariant was violated (e.g. negative cost delta)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Resource temporarily unavailable
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Missing referenced secret
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a cluster runtime error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::ClusterRuntime(msg.into())
    }

    /// Create a cloud provider error
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a pricing error
    pub fn pricing(msg: impl Into<String>) -> Self {
        Self::Pricing(msg.into())
    }

    /// Create an alert error
    pub fn alert(msg: impl Into<String>) -> Self {
        Self::Alert(msg.into())
    }

    /// Create an admission error
    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is a transient external failure worth requeueing
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ClusterRuntime(_)
                | Error::Cloud(_)
                | Error::Metrics(_)
                | Error::Store(_)
                | Error::Pricing(_)
                | Error::Alert(_)
                | Error::Unavailable(_)
                | Error::Timeout(_)
                | Error::Internal(_)
        )
    }

    /// Check if this error should be surfaced on an object's status
    /// condition rather than silently retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_)
                | Error::InvalidRequest(_)
                | Error::SecretNotFound(_)
                | Error::Config(_)
        )
    }

    /// Check if this error aborts the current reconcile entirely
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::ClusterRuntime(_) => "cluster_runtime",
            Error::Cloud(_) => "cloud",
            Error::Metrics(_) => "metrics",
            Error::Store(_) => "store",
            Error::Pricing(_) => "pricing",
            Error::Alert(_) => "alert",
            Error::Admission(_) => "admission",
            Error::InvariantViolation(_) => "invariant",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Unavailable(_) => "unavailable",
            Error::Timeout(_) => "timeout",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Internal(_) => "internal",
            Error::SecretNotFound(_) => "secret_not_found",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original))
        })
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let original = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", f(), original))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("bad threshold");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: bad threshold");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::cloud("test").category(), "cloud");
        assert_eq!(Error::metrics("test").category(), "metrics");
        assert_eq!(Error::invariant("test").category(), "invariant");
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::cloud("asg down").is_retryable());
        assert!(Error::store("insert failed").is_retryable());
        assert!(!Error::config("unknown pool").is_retryable());
        assert!(!Error::invariant("negative delta").is_retryable());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(Error::config("x").is_configuration());
        assert!(Error::SecretNotFound("slack-hook".into()).is_configuration());
        assert!(!Error::cloud("x").is_configuration());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::invariant("cost went backwards").is_fatal());
        assert!(!Error::cloud("x").is_fatal());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result.with_context("failed to read config").unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(err.to_string().contains("failed to read config"));
        assert!(err.to_string().contains("file not found"));
    }
}
