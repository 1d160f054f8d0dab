use thiserror::Error;

/// Failure taxonomy for a single generation call.
///
/// `RateLimitExceeded` is terminal for a whole batch and is never retried
/// locally; `GenerationFailed` covers every other cause and is recoverable
/// by retrying the single item. Both carry the upstream message verbatim
/// so the user can diagnose the real cause.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl GenerateError {
    /// Classify an opaque upstream error message. Structured signals (HTTP
    /// 429) are mapped before this is consulted; the substring check is a
    /// best-effort fallback over free-form provider text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            GenerateError::RateLimitExceeded(message)
        } else {
            GenerateError::GenerationFailed(message)
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GenerateError::RateLimitExceeded(_))
    }

    /// The underlying upstream message, without the category label.
    pub fn message(&self) -> &str {
        match self {
            GenerateError::RateLimitExceeded(m) | GenerateError::GenerationFailed(m) => m,
        }
    }
}

/// Heuristic over provider error text. The upstream API does not expose a
/// structured quota error on every path, so "quota"/"limit" substrings are
/// the fallback signal.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota") || lower.contains("limit")
}

/// Errors raised by the project save/load boundary.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// The snapshot is structurally unusable. Loading never mutates the
    /// current in-memory state when this is returned.
    #[error("invalid project file: {0}")]
    InvalidFormat(String),
}
