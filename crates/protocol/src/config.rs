use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Call gateway tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Maximum concurrently dispatched model calls.
    pub concurrency: usize,
    /// Minimum interval between dispatches, globally enforced.
    pub min_dispatch_interval_ms: u64,
    /// Maximum retries for a retryable failure before giving up.
    pub max_retries: u32,
    /// Backoff base; delay before attempt n is base * 2^(n-1), capped.
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Consecutive retryable failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open once tripped.
    pub cooldown_ms: u64,
    /// Re-insert retries at the queue front (ahead of fresh work).
    ///
    /// Front insertion can starve fresh low-priority work under sustained
    /// failures; it is a deliberate tunable, not an accident.
    pub retry_at_front: bool,
    /// Bound on fresh submissions waiting in the queue. Submissions beyond
    /// the bound fail fast; retry re-insertions are exempt.
    pub max_queue_depth: usize,
    /// Call timeout handed to the transport.
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            min_dispatch_interval_ms: 200,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            failure_threshold: 5,
            cooldown_ms: 30_000,
            retry_at_front: true,
            max_queue_depth: 256,
            request_timeout_ms: 60_000,
        }
    }
}

impl GatewayConfig {
    /// Backoff before retry attempt `attempt` (1-based), exponential and
    /// capped.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Response cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for expansion decisions.
    pub expansion_ttl_secs: u64,
    /// TTL for similarity verdicts.
    pub similarity_ttl_secs: u64,
    /// Global byte budget; oldest-inserted entries are evicted when over.
    pub byte_budget: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expansion_ttl_secs: 3_600,
            similarity_ttl_secs: 3_600,
            byte_budget: 8 * 1024 * 1024,
        }
    }
}

/// Expansion circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Hard depth ceiling regardless of confidence.
    pub max_depth: usize,
    /// Times the same node id may be expanded before it is forced atomic.
    pub repetition_limit: u32,
    /// A single-file theme at or under this many changed lines with at most
    /// one changed unit is structurally atomic.
    pub atomic_line_threshold: usize,
    /// Allowed depth is `complexity_depth_factor * complexity_score`;
    /// beyond that expansion is refused.
    pub complexity_depth_factor: f64,
    /// Base confidence required to accept an expand decision at depth 0.
    pub base_confidence_threshold: f64,
    /// Threshold decrease per level of depth.
    pub confidence_depth_step: f64,
    /// Threshold bump for nodes flagged high-complexity.
    pub high_complexity_bump: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            repetition_limit: 2,
            atomic_line_threshold: 15,
            complexity_depth_factor: 1.5,
            base_confidence_threshold: 0.7,
            confidence_depth_step: 0.05,
            high_complexity_bump: 0.05,
        }
    }
}

/// Consolidation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Name similarity at or above which a pair merges without a model call.
    pub name_merge_threshold: f64,
    /// Model-backed verdict confidence required to act on it.
    pub verdict_confidence_threshold: f64,
    /// Pairs escalated to the model per batched similarity request.
    pub batch_size: usize,
    pub skip_sibling_pass: bool,
    pub skip_cross_level_pass: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            name_merge_threshold: 0.95,
            verdict_confidence_threshold: 0.6,
            batch_size: 8,
            skip_sibling_pass: false,
            skip_cross_level_pass: false,
        }
    }
}

/// Full configuration surface, read once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub consolidation: ConsolidationConfig,
    /// Use the heuristic fallback when the model path fails permanently.
    pub fallback_enabled: bool,
}

impl AnalysisConfig {
    /// Defaults with fallback enabled, the production posture.
    pub fn standard() -> Self {
        Self {
            fallback_enabled: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(cfg.backoff_for_attempt(2), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff_for_attempt(3), Duration::from_millis(2_000));
        assert_eq!(cfg.backoff_for_attempt(10), Duration::from_millis(8_000));
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = AnalysisConfig::standard();
        let text = toml::to_string(&cfg).expect("serialize");
        let back: AnalysisConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(back.gateway.concurrency, cfg.gateway.concurrency);
        assert_eq!(back.breaker.max_depth, cfg.breaker.max_depth);
        assert!(back.fallback_enabled);
    }
}
