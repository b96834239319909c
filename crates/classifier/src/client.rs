//! Typed classification front door.
//!
//! `classify` is the only way the engines talk to the model: it consults
//! the shared cache, renders the prompt, goes through the shared gateway,
//! recovers a typed payload at the extractor boundary, and caches the
//! result. When the model path fails in a non-retryable way (or retries
//! are exhausted), the heuristic fallback produces a schema-compatible
//! answer at reduced confidence — callers only see the `origin` tag.

use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::error::ClassifierError;
use crate::extract::{extract, ExpectedShape};
use crate::fallback::FallbackAnalyzer;
use crate::gateway::CallGateway;
use crate::prompt;
use theme_protocol::{
    ClassificationKind, ClassificationPayload, ClassificationRequest, ExpansionDecision,
    Origin, SimilarityVerdict,
};

/// Outcome of one classification, with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub success: bool,
    pub payload: Option<ClassificationPayload>,
    pub confidence: f64,
    pub origin: Origin,
    pub error: Option<String>,
}

impl ClassificationResult {
    fn resolved(payload: ClassificationPayload, origin: Origin) -> Self {
        let confidence = payload_confidence(&payload);
        Self {
            success: true,
            payload: Some(payload),
            confidence,
            origin,
            error: None,
        }
    }

    fn failed(error: ClassifierError) -> Self {
        Self {
            success: false,
            payload: None,
            confidence: 0.0,
            origin: Origin::Fallback,
            error: Some(error.to_string()),
        }
    }
}

fn payload_confidence(payload: &ClassificationPayload) -> f64 {
    match payload {
        ClassificationPayload::Expansion(decision) => decision.confidence,
        ClassificationPayload::Similarity { verdicts } => {
            if verdicts.is_empty() {
                0.0
            } else {
                verdicts.iter().map(|v| v.confidence).sum::<f64>() / verdicts.len() as f64
            }
        }
    }
}

fn shape_for(kind: ClassificationKind) -> ExpectedShape {
    match kind {
        ClassificationKind::Expansion => ExpectedShape::Object {
            required: &["expand", "confidence"],
        },
        ClassificationKind::Similarity => ExpectedShape::Object {
            required: &["verdicts"],
        },
    }
}

/// Shared classification client. Clone-cheap via `Arc` fields.
#[derive(Clone)]
pub struct ClassificationClient {
    cache: Arc<ResponseCache>,
    gateway: Arc<CallGateway>,
    fallback: Arc<FallbackAnalyzer>,
    fallback_enabled: bool,
}

impl ClassificationClient {
    pub fn new(
        cache: Arc<ResponseCache>,
        gateway: Arc<CallGateway>,
        fallback_enabled: bool,
    ) -> Self {
        Self {
            cache,
            gateway,
            fallback: Arc::new(FallbackAnalyzer::new()),
            fallback_enabled,
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn gateway(&self) -> &Arc<CallGateway> {
        &self.gateway
    }

    /// Issue a typed request through cache → gateway → extractor.
    pub async fn classify(&self, request: &ClassificationRequest) -> ClassificationResult {
        let key = request.cache_key();
        if let Some(payload) = self.cache.get(&key) {
            return ClassificationResult::resolved(payload, Origin::Cached);
        }

        match self.model_path(request).await {
            Ok(payload) => {
                self.cache
                    .set(&key, payload.clone(), self.cache.ttl_for(request.kind));
                ClassificationResult::resolved(payload, Origin::Fresh)
            }
            Err(err) => {
                log::debug!("model path failed for {key}: {err}");
                if self.fallback_enabled {
                    match self.fallback.analyze(request) {
                        Some(payload) => {
                            ClassificationResult::resolved(payload, Origin::Fallback)
                        }
                        None => ClassificationResult::failed(err),
                    }
                } else {
                    ClassificationResult::failed(err)
                }
            }
        }
    }

    /// Batched lookup: resolve what the cache has in one pass, classify the
    /// rest sequentially through the shared gateway.
    pub async fn classify_batch(
        &self,
        requests: &[ClassificationRequest],
    ) -> Vec<ClassificationResult> {
        let keys: Vec<String> = requests.iter().map(ClassificationRequest::cache_key).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let cached = self.cache.get_batch(&key_refs);

        let mut out = Vec::with_capacity(requests.len());
        for (request, hit) in requests.iter().zip(cached) {
            match hit {
                Some(payload) => {
                    out.push(ClassificationResult::resolved(payload, Origin::Cached))
                }
                None => out.push(self.classify(request).await),
            }
        }
        out
    }

    async fn model_path(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationPayload, ClassifierError> {
        let rendered = prompt::render(request);
        let raw = self.gateway.submit(rendered, request.priority).await?;
        let value = extract(&raw, &shape_for(request.kind))?;
        typed_payload(request.kind, value)
    }
}

/// Parse a validated JSON value into the typed payload for the kind.
fn typed_payload(
    kind: ClassificationKind,
    value: serde_json::Value,
) -> Result<ClassificationPayload, ClassifierError> {
    match kind {
        ClassificationKind::Expansion => {
            let mut decision: ExpansionDecision = serde_json::from_value(value)
                .map_err(|e| ClassifierError::PayloadMismatch(e.to_string()))?;
            decision.confidence = decision.confidence.clamp(0.0, 1.0);
            Ok(ClassificationPayload::Expansion(decision))
        }
        ClassificationKind::Similarity => {
            let verdicts = value
                .get("verdicts")
                .cloned()
                .unwrap_or(serde_json::Value::Array(vec![]));
            let mut verdicts: Vec<SimilarityVerdict> = serde_json::from_value(verdicts)
                .map_err(|e| ClassifierError::PayloadMismatch(e.to_string()))?;
            for v in &mut verdicts {
                v.confidence = v.confidence.clamp(0.0, 1.0);
            }
            Ok(ClassificationPayload::Similarity { verdicts })
        }
    }
}
