//! Classification layer for Theme Finder.
//!
//! Everything between the engines and the external text model lives here:
//! - `ResponseCache`: TTL + byte-budget keyed response cache
//! - `extract`: recovery of structured payloads from free-form model text
//! - `CallGateway`: shared FIFO queue, concurrency cap, retry policy and
//!   circuit breaker in front of the transport
//! - `ClassificationClient`: typed requests through cache → gateway →
//!   extractor, with heuristic fallback at reduced confidence
//!
//! None of this is process-global: callers construct one gateway/cache pair
//! per analysis run and share it via `Arc`, so tests get isolated instances.

pub mod cache;
pub mod client;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod gateway;
pub mod prompt;
pub mod test_support;
pub mod transport;

pub use cache::{CacheSnapshot, ResponseCache};
pub use client::{ClassificationClient, ClassificationResult};
pub use error::{ClassifierError, ExtractError, GatewayError, Result, TransportError};
pub use extract::{extract, validate_shape, ExpectedShape};
pub use fallback::FallbackAnalyzer;
pub use gateway::{CallGateway, GatewaySnapshot};
pub use transport::ModelTransport;
