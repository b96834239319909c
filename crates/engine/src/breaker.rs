//! Expansion circuit breaker: may this node still be decomposed?
//!
//! A refusal forces the node atomic. The gate guarantees termination even
//! when the model always answers "expand": depth has a hard ceiling, each
//! node id may only be expanded a bounded number of times, and small nodes
//! are cut off structurally before any model call is spent on them.

use std::sync::Arc;

use crate::ledger::ExpansionLedger;
use theme_protocol::{BreakerConfig, ThemeNode};

/// Complexity score at or above which a node counts as high-complexity for
/// confidence thresholding.
const HIGH_COMPLEXITY_SCORE: f64 = 8.0;

/// Outcome of the expansion gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionGate {
    Allow,
    /// Refused; the reason becomes the node's atomic reason.
    Refuse(String),
}

pub struct ExpansionBreaker {
    cfg: BreakerConfig,
    ledger: Arc<ExpansionLedger>,
}

impl ExpansionBreaker {
    pub fn new(cfg: BreakerConfig, ledger: Arc<ExpansionLedger>) -> Self {
        Self { cfg, ledger }
    }

    pub fn ledger(&self) -> &Arc<ExpansionLedger> {
        &self.ledger
    }

    /// Decide whether `node` at `depth` may be decomposed. Any single
    /// failing check refuses expansion.
    pub fn allow(&self, node: &ThemeNode, depth: usize) -> ExpansionGate {
        if depth >= self.cfg.max_depth {
            return ExpansionGate::Refuse(format!(
                "maximum decomposition depth {} reached",
                self.cfg.max_depth
            ));
        }

        if let Some(reason) = self.ledger.atomic_reason(node.id) {
            return ExpansionGate::Refuse(reason);
        }

        let attempts = self.ledger.attempts(node.id);
        if attempts >= self.cfg.repetition_limit {
            return ExpansionGate::Refuse(format!(
                "node already expanded {attempts} times (limit {})",
                self.cfg.repetition_limit
            ));
        }

        if let Some(reason) = self.structural_atomicity(node) {
            return ExpansionGate::Refuse(reason);
        }

        let score = complexity_score(node);
        let allowed_depth = self.cfg.complexity_depth_factor * score;
        if depth as f64 > allowed_depth {
            return ExpansionGate::Refuse(format!(
                "depth {depth} exceeds complexity allowance ({allowed_depth:.1})"
            ));
        }

        ExpansionGate::Allow
    }

    /// Small-node cutoffs that need no model call.
    fn structural_atomicity(&self, node: &ThemeNode) -> Option<String> {
        let lines = node.scope.line_count();
        if lines <= 1 {
            return Some("single line of change".to_string());
        }
        let files = node.scope.files();
        if files.len() == 1
            && lines <= self.cfg.atomic_line_threshold
            && node.scope.ranges.len() <= 1
        {
            return Some(format!(
                "single file with {lines} changed lines (threshold {}) in one changed unit",
                self.cfg.atomic_line_threshold
            ));
        }
        None
    }

    /// Dynamic acceptance threshold for an expand decision: lower with
    /// depth (deeper nodes are presumptively simpler), slightly higher for
    /// high-complexity nodes.
    pub fn confidence_threshold(&self, node: &ThemeNode, depth: usize) -> f64 {
        let mut threshold = self.cfg.base_confidence_threshold
            - self.cfg.confidence_depth_step * depth as f64;
        if complexity_score(node) >= HIGH_COMPLEXITY_SCORE {
            threshold += self.cfg.high_complexity_bump;
        }
        threshold.clamp(0.3, 0.95)
    }
}

/// Rough size-and-structure score: file count, description length, snippet
/// count and existing children all push it up.
pub fn complexity_score(node: &ThemeNode) -> f64 {
    let files = node.scope.files().len() as f64;
    let snippets = node.scope.ranges.len() as f64;
    let description = node.description.len() as f64 / 100.0;
    let children = node.children.len() as f64;
    files + snippets + description + children
}

#[cfg(test)]
mod tests {
    use super::*;
    use theme_protocol::{CodeScope, ScopeRange, ThemeId};

    fn node_with_scope(ranges: Vec<(&str, usize, usize)>) -> ThemeNode {
        let scope = CodeScope::new(
            ranges
                .into_iter()
                .map(|(f, s, e)| ScopeRange {
                    file: f.to_string(),
                    start_line: s,
                    end_line: e,
                })
                .collect(),
        );
        ThemeNode::new(ThemeId(1), "theme", scope)
    }

    fn breaker() -> ExpansionBreaker {
        ExpansionBreaker::new(BreakerConfig::default(), Arc::new(ExpansionLedger::new()))
    }

    #[test]
    fn refuses_beyond_max_depth_regardless_of_size() {
        let b = breaker();
        let node = node_with_scope(vec![("a.rs", 1, 500), ("b.rs", 1, 500)]);
        assert!(matches!(b.allow(&node, 10), ExpansionGate::Refuse(_)));
        assert_eq!(b.allow(&node, 3), ExpansionGate::Allow);
    }

    #[test]
    fn single_line_node_is_structurally_atomic() {
        let b = breaker();
        let node = node_with_scope(vec![("a.rs", 4, 4)]);
        match b.allow(&node, 0) {
            ExpansionGate::Refuse(reason) => assert!(reason.contains("single line")),
            ExpansionGate::Allow => panic!("single-line node must refuse"),
        }
    }

    #[test]
    fn small_single_file_single_unit_is_atomic() {
        let b = breaker();
        let node = node_with_scope(vec![("a.rs", 1, 12)]);
        match b.allow(&node, 0) {
            ExpansionGate::Refuse(reason) => {
                assert!(reason.contains("12 changed lines"));
            }
            ExpansionGate::Allow => panic!("small node must refuse"),
        }
    }

    #[test]
    fn repetition_limit_forces_atomic() {
        let ledger = Arc::new(ExpansionLedger::new());
        let b = ExpansionBreaker::new(BreakerConfig::default(), Arc::clone(&ledger));
        let node = node_with_scope(vec![("a.rs", 1, 100), ("b.rs", 1, 100)]);
        ledger.record_attempt(node.id);
        ledger.record_attempt(node.id);
        assert!(matches!(b.allow(&node, 1), ExpansionGate::Refuse(_)));
    }

    #[test]
    fn memoized_atomic_short_circuits() {
        let ledger = Arc::new(ExpansionLedger::new());
        let b = ExpansionBreaker::new(BreakerConfig::default(), Arc::clone(&ledger));
        let node = node_with_scope(vec![("a.rs", 1, 100), ("b.rs", 1, 100)]);
        ledger.memoize_atomic(node.id, "previously judged atomic");
        match b.allow(&node, 0) {
            ExpansionGate::Refuse(reason) => {
                assert_eq!(reason, "previously judged atomic");
            }
            ExpansionGate::Allow => panic!("memo must refuse"),
        }
    }

    #[test]
    fn complexity_allowance_caps_depth_for_simple_nodes() {
        let b = breaker();
        // Two files, two snippets: score 4, allowance 6. Depth 7 refuses.
        let node = node_with_scope(vec![("a.rs", 1, 40), ("b.rs", 1, 40)]);
        match b.allow(&node, 7) {
            ExpansionGate::Refuse(reason) => {
                assert!(reason.contains("complexity allowance"));
            }
            ExpansionGate::Allow => panic!("depth beyond allowance must refuse"),
        }
    }

    #[test]
    fn confidence_threshold_decreases_with_depth() {
        let b = breaker();
        let node = node_with_scope(vec![("a.rs", 1, 40), ("b.rs", 1, 40)]);
        let shallow = b.confidence_threshold(&node, 0);
        let deep = b.confidence_threshold(&node, 6);
        assert!(deep < shallow);
    }
}
