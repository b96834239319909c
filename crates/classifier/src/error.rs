use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClassifierError>;

/// Failure reported by the model transport.
///
/// Classification into retryable vs permanent is a pure function of the
/// variant; the gateway never inspects anything else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("transport i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Network/timeout/5xx/rate-limit failures are retryable; auth and
    /// malformed-request failures exhaust immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout
            | TransportError::ConnectionReset
            | TransportError::RateLimited
            | TransportError::Io(_) => true,
            TransportError::Status(code) => *code >= 500,
            TransportError::Auth(_) | TransportError::MalformedRequest(_) => false,
        }
    }
}

/// Terminal outcome of a gateway submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("queue is full ({depth} items)")]
    QueueFull { depth: usize },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    #[error("permanent transport failure: {0}")]
    Permanent(TransportError),

    #[error("gateway shut down before the request resolved")]
    Closed,
}

/// Failure to recover a structured payload from model text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no structured payload found in model text (preview: {preview:?})")]
    NoPayload { preview: String },

    #[error("payload failed shape validation: expected {expected}, missing fields {missing:?} (preview: {preview:?})")]
    ShapeMismatch {
        expected: &'static str,
        missing: Vec<String>,
        preview: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("payload did not match request kind: {0}")]
    PayloadMismatch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_is_pure_and_total() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::ConnectionReset.is_retryable());
        assert!(TransportError::RateLimited.is_retryable());
        assert!(TransportError::Status(503).is_retryable());
        assert!(!TransportError::Status(400).is_retryable());
        assert!(!TransportError::Auth("bad key".into()).is_retryable());
        assert!(!TransportError::MalformedRequest("empty".into()).is_retryable());
    }
}
