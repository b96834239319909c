use crate::error::TransportError;
use async_trait::async_trait;

/// Opaque boundary to the external generative model.
///
/// The contract is intentionally minimal: given prompt text, return response
/// text or fail. Everything else (queueing, retries, rate limiting, breaker,
/// extraction) is this crate's job, not the transport's.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, TransportError>;
}
