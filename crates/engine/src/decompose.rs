//! Recursive decomposition of theme nodes.
//!
//! Each node goes `Unevaluated → Atomic(reason)` or `Unevaluated →
//! Expanded` with children that restart the cycle one level deeper.
//! Sibling branches run on independent tasks; a node's expansion future
//! completes only after every descendant's has resolved. The only shared
//! mutable state is the breaker's ledger (and the classifier's shared
//! cache/gateway behind it).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::breaker::{ExpansionBreaker, ExpansionGate};
use theme_classifier::ClassificationClient;
use theme_protocol::{
    ClassificationKind, ClassificationPayload, ClassificationRequest, CodeScope,
    ExpansionDecision, ExpansionState, ThemeId, ThemeNode,
};

/// Monotonic theme id allocator for one analysis run.
#[derive(Default)]
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> ThemeId {
        ThemeId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub struct DecompositionEngine {
    client: ClassificationClient,
    breaker: Arc<ExpansionBreaker>,
    ids: Arc<IdGen>,
}

impl DecompositionEngine {
    pub fn new(
        client: ClassificationClient,
        breaker: Arc<ExpansionBreaker>,
        ids: Arc<IdGen>,
    ) -> Self {
        Self {
            client,
            breaker,
            ids,
        }
    }

    /// Expand a root theme to completion.
    pub async fn expand_root(&self, node: ThemeNode) -> ThemeNode {
        self.expand(node, 0).await
    }

    /// Boxed recursion: the engine clones into the future so subtrees are
    /// `'static` and can run on spawned tasks. Depth is bounded by the
    /// breaker, which keeps the future chain within the configured ceiling.
    fn expand(
        &self,
        node: ThemeNode,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = ThemeNode> + Send + 'static>> {
        let engine = self.clone();
        Box::pin(async move { engine.expand_inner(node, depth).await })
    }

    async fn expand_inner(&self, mut node: ThemeNode, depth: usize) -> ThemeNode {
        let gate = self.breaker.allow(&node, depth);
        if let ExpansionGate::Refuse(reason) = gate {
            log::debug!("{} refused at depth {depth}: {reason}", node.id);
            self.breaker.ledger().memoize_atomic(node.id, &reason);
            node.expansion = ExpansionState::Atomic { reason };
            return node;
        }
        self.breaker.ledger().record_attempt(node.id);

        let request = expansion_request(&node, depth);
        let result = self.client.classify(&request).await;
        let decision = match result.payload {
            Some(ClassificationPayload::Expansion(decision)) if result.success => decision,
            _ => {
                // A fully failed classification still yields a valid,
                // low-confidence node; sibling subtrees are unaffected.
                let reason = format!(
                    "classification unavailable: {}",
                    result.error.as_deref().unwrap_or("no payload")
                );
                self.breaker.ledger().memoize_atomic(node.id, &reason);
                node.expansion = ExpansionState::Atomic { reason };
                node.confidence = node.confidence.max(0.1);
                return node;
            }
        };

        node.confidence = decision.confidence;
        if node.business_context.is_empty() {
            node.business_context = decision.business_context.clone();
        }
        if node.technical_context.is_empty() {
            node.technical_context = decision.technical_context.clone();
        }

        let threshold = self.breaker.confidence_threshold(&node, depth);
        if !decision.expand || decision.confidence < threshold {
            let reason = if decision.expand {
                format!(
                    "expand confidence {:.2} below threshold {threshold:.2}",
                    decision.confidence
                )
            } else {
                "classifier judged the theme single-purpose".to_string()
            };
            self.breaker.ledger().memoize_atomic(node.id, &reason);
            node.expansion = ExpansionState::Atomic { reason };
            return node;
        }

        if let Err(problem) = validate_partition(&node.scope, &decision) {
            // Code coverage must never silently disappear: a bad split
            // degrades the node to atomic instead of dropping lines.
            let reason = format!("proposed split rejected: {problem}");
            log::warn!("{}: {reason}", node.id);
            self.breaker.ledger().memoize_atomic(node.id, &reason);
            node.expansion = ExpansionState::Atomic { reason };
            return node;
        }

        let children = self.build_children(&node, decision);

        // Per-child recursion on independent tasks; completion order does
        // not matter, child order in the parent does.
        let mut handles = Vec::with_capacity(children.len());
        for child in children {
            handles.push(tokio::spawn(self.expand(child, depth + 1)));
        }
        let mut expanded = Vec::with_capacity(handles.len());
        for handle in handles {
            expanded.push(handle.await.expect("child expansion task panicked"));
        }

        node.children = expanded;
        node.expansion = ExpansionState::Expanded;
        node
    }

    fn build_children(&self, parent: &ThemeNode, decision: ExpansionDecision) -> Vec<ThemeNode> {
        decision
            .children
            .into_iter()
            .map(|spec| {
                let mut child = ThemeNode::new(self.ids.next(), spec.name, spec.scope);
                child.parent = Some(parent.id);
                child.level = parent.level + 1;
                child.description = spec.description;
                child
            })
            .collect()
    }
}

/// Accept a split only when every child owns a non-empty slice and the
/// children together cover the parent scope exactly, no line twice.
fn validate_partition(
    parent: &CodeScope,
    decision: &ExpansionDecision,
) -> std::result::Result<(), String> {
    if decision.children.is_empty() {
        return Err("expand decision carried no children".to_string());
    }
    if let Some(empty) = decision.children.iter().find(|c| c.scope.is_empty()) {
        return Err(format!("child {:?} has an empty scope", empty.name));
    }
    let scopes: Vec<&CodeScope> = decision.children.iter().map(|c| &c.scope).collect();
    if !parent.is_partitioned_by(&scopes) {
        return Err("children scopes do not partition the parent scope exactly".to_string());
    }
    Ok(())
}

fn expansion_request(node: &ThemeNode, depth: usize) -> ClassificationRequest {
    ClassificationRequest::new(ClassificationKind::Expansion)
        .with_param("name", node.name.clone())
        .with_param("description", node.description.clone())
        .with_param(
            "scope_json",
            serde_json::to_string(&node.scope).unwrap_or_else(|_| "{}".to_string()),
        )
        .with_param("depth", depth.to_string())
        .with_param("file_count", node.scope.files().len().to_string())
        .with_param("changed_lines", node.scope.line_count().to_string())
}
