//! Error types for orchestration operations.

/// The main error type for AI operations.
///
/// The enum is `Clone` so that a single coalesced outcome can be handed to
/// every caller waiting on the same cache key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    /// Malformed request, surfaced immediately and never retried
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Execution mode precondition unmet
    #[error("Insufficient input: {0}")]
    InsufficientInput(String),

    /// Function identifier missing from the registry
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Strict registration of an identifier that already exists
    #[error("Duplicate function: {0}")]
    DuplicateFunction(String),

    /// Circuit for this provider is open
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Every eligible provider has an open circuit
    #[error("All providers unavailable")]
    AllProvidersUnavailable,

    /// Network, timeout, 5xx or connection reset
    #[error("Transient dispatch error: {0}")]
    Transient(String),

    /// Rate limit errors
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Non-transient backend errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// Retry budget spent
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<AiError> },

    /// Request deadline elapsed
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl AiError {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an insufficient input error
    pub fn insufficient_input(msg: impl Into<String>) -> Self {
        Self::InsufficientInput(msg.into())
    }

    /// Create a provider unavailable error
    pub fn provider_unavailable(provider: impl Into<String>) -> Self {
        Self::ProviderUnavailable(provider.into())
    }

    /// Create a transient dispatch error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Map an HTTP status returned by a backend into the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Authentication(format!("HTTP {status}: {body}")),
            408 => Self::Transient(format!("HTTP {status}: {body}")),
            429 => Self::RateLimit(format!("HTTP {status}: {body}")),
            400..=499 => Self::InvalidRequest(format!("HTTP {status}: {body}")),
            500..=599 => Self::Transient(format!("HTTP {status}: {body}")),
            _ => Self::Provider(format!("HTTP {status}: {body}")),
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::Transient(_) | AiError::RateLimit(_) | AiError::Stream(_)
        )
    }

    /// Whether this failure counts toward a provider's circuit-breaker threshold.
    ///
    /// Caller-side problems (validation, insufficient input, backend 4xx
    /// complaining about the request) and cancellation never do.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            AiError::Transient(_)
                | AiError::RateLimit(_)
                | AiError::Authentication(_)
                | AiError::Provider(_)
                | AiError::Stream(_)
                | AiError::Serialization(_)
                | AiError::Timeout(_)
        )
    }

    /// Whether this error ends the request as `Cancelled` rather than `Failed`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AiError::Cancelled)
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return Self::Transient(err.to_string());
        }
        if err.is_decode() {
            return Self::Serialization(err.to_string());
        }
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for AiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<String> for AiError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<&str> for AiError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(AiError::from_status(503, "busy"), AiError::Transient(_)));
        assert!(matches!(AiError::from_status(429, "slow down"), AiError::RateLimit(_)));
        assert!(matches!(AiError::from_status(401, "bad key"), AiError::Authentication(_)));
        assert!(matches!(AiError::from_status(400, "bad body"), AiError::InvalidRequest(_)));
    }

    #[test]
    fn test_caller_errors_do_not_count_against_provider() {
        assert!(!AiError::invalid_request("x").is_backend_failure());
        assert!(!AiError::insufficient_input("x").is_backend_failure());
        assert!(!AiError::Cancelled.is_backend_failure());
        assert!(!AiError::from_status(400, "x").is_backend_failure());

        assert!(AiError::transient("reset").is_backend_failure());
        assert!(AiError::from_status(500, "x").is_backend_failure());
    }

    #[test]
    fn test_retryable() {
        assert!(AiError::transient("reset").is_retryable());
        assert!(AiError::rate_limit("x").is_retryable());
        assert!(!AiError::Cancelled.is_retryable());
        assert!(!AiError::timeout("deadline").is_retryable());
        assert!(!AiError::authentication("x").is_retryable());
    }
}
