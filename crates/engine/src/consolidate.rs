//! Consolidation: merge redundant themes within a sibling group and
//! collapse duplicates across levels.
//!
//! The cheap pre-filter decides the obvious pairs; uncertain pairs are
//! escalated in batches through the same classification client (and so the
//! same cache and gateway) as decomposition. Every merge keeps the tree
//! invariants intact: scopes union, children re-parent with adjusted
//! levels, and no line of code is dropped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::decompose::IdGen;
use crate::similarity::{prefilter, PreFilter};
use theme_classifier::ClassificationClient;
use theme_protocol::{
    ClassificationKind, ClassificationPayload, ClassificationRequest, ConsolidationConfig,
    CrossReference, ExpansionState, RequestPriority, SimilarityPair, SimilarityVerdict,
    ThemeForest, ThemeId, ThemeNode, Verdict,
};

pub struct ConsolidationEngine {
    client: ClassificationClient,
    cfg: ConsolidationConfig,
    ids: Arc<IdGen>,
}

/// What to do with one sibling pair.
enum SiblingAction {
    Merge(usize, usize),
    Link(usize, usize),
}

/// What to do with one ancestor/descendant pair.
enum CrossAction {
    Collapse { ancestor: ThemeId, descendant: ThemeId },
    Link { ancestor: ThemeId, descendant: ThemeId },
}

impl ConsolidationEngine {
    pub fn new(client: ClassificationClient, cfg: ConsolidationConfig, ids: Arc<IdGen>) -> Self {
        Self { client, cfg, ids }
    }

    /// Run both consolidation passes over a forest. Safe to re-run: a
    /// consolidated forest comes back unchanged.
    pub async fn consolidate(&self, forest: ThemeForest) -> ThemeForest {
        let mut roots = forest.roots;
        if !self.cfg.skip_sibling_pass {
            roots = self.consolidate_siblings(roots).await;
            let mut consolidated = Vec::with_capacity(roots.len());
            for root in roots {
                consolidated.push(self.consolidate_subtree(root).await);
            }
            roots = consolidated;
        }
        if !self.cfg.skip_cross_level_pass {
            for root in &mut roots {
                self.cross_level(root).await;
            }
        }
        ThemeForest { roots }
    }

    /// Sibling pass applied recursively below one node.
    fn consolidate_subtree(
        &self,
        mut node: ThemeNode,
    ) -> Pin<Box<dyn Future<Output = ThemeNode> + Send + '_>> {
        Box::pin(async move {
            let children = std::mem::take(&mut node.children);
            let merged = self.consolidate_siblings(children).await;
            let mut done = Vec::with_capacity(merged.len());
            for child in merged {
                done.push(self.consolidate_subtree(child).await);
            }
            // Merges may have re-parented grandchildren; restore the links.
            let id = node.id;
            let level = node.level;
            for child in &mut done {
                child.parent = Some(id);
                set_subtree_level(child, level + 1);
            }
            node.children = done;
            node
        })
    }

    /// Merge and link within one sibling list until a fixed point. Each
    /// merge shrinks the list and each link retires a pair, so this
    /// terminates.
    async fn consolidate_siblings(&self, mut nodes: Vec<ThemeNode>) -> Vec<ThemeNode> {
        loop {
            match self.next_sibling_action(&nodes).await {
                None => return nodes,
                Some(SiblingAction::Merge(i, j)) => {
                    // Remove the later index first so the earlier stays valid.
                    let merged_away = nodes.remove(j);
                    let survivor = nodes.remove(i);
                    log::debug!("merging sibling {} into {}", merged_away.id, survivor.id);
                    nodes.insert(i, self.merge_nodes(survivor, merged_away));
                }
                Some(SiblingAction::Link(i, j)) => {
                    let (a, b) = (nodes[i].id, nodes[j].id);
                    cross_link(&mut nodes[i], b);
                    cross_link(&mut nodes[j], a);
                }
            }
        }
    }

    /// First actionable sibling pair, by pre-filter or escalation.
    ///
    /// Duplicates merge. Same-level overlap keeps both nodes and links
    /// them instead, since siblings own disjoint scope by construction.
    async fn next_sibling_action(&self, nodes: &[ThemeNode]) -> Option<SiblingAction> {
        let linked = linked_pairs(nodes.iter());
        let mut uncertain = Vec::new();
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                if linked.contains(&(nodes[i].id, nodes[j].id)) {
                    continue;
                }
                match prefilter(&nodes[i], &nodes[j], &self.cfg) {
                    PreFilter::Merge => return Some(SiblingAction::Merge(i, j)),
                    PreFilter::Distinct => {}
                    PreFilter::Uncertain => uncertain.push((i, j)),
                }
            }
        }
        if uncertain.is_empty() {
            return None;
        }

        let pairs: Vec<SimilarityPair> = uncertain
            .iter()
            .map(|&(i, j)| pair_for(&nodes[i], &nodes[j]))
            .collect();
        let verdicts = self.escalate(&pairs).await;
        for &(i, j) in &uncertain {
            let Some(v) = verdicts.get(&(nodes[i].id, nodes[j].id)) else {
                continue;
            };
            if v.confidence < self.cfg.verdict_confidence_threshold {
                continue;
            }
            match v.verdict {
                Verdict::Duplicate => return Some(SiblingAction::Merge(i, j)),
                Verdict::Overlap => return Some(SiblingAction::Link(i, j)),
                Verdict::Distinct => {}
            }
        }
        None
    }

    /// Batched model-backed similarity requests for uncertain pairs.
    ///
    /// Escalations are bulk work, so they queue at low priority behind
    /// expansion requests.
    async fn escalate(
        &self,
        pairs: &[SimilarityPair],
    ) -> HashMap<(ThemeId, ThemeId), SimilarityVerdict> {
        let requests: Vec<ClassificationRequest> = pairs
            .chunks(self.cfg.batch_size.max(1))
            .filter_map(|chunk| {
                let pairs_json = serde_json::to_string(chunk).ok()?;
                let mut request = ClassificationRequest::new(ClassificationKind::Similarity)
                    .with_param("pairs_json", pairs_json)
                    .with_param("pair_count", chunk.len().to_string());
                request.priority = RequestPriority::Low;
                Some(request)
            })
            .collect();

        let mut verdicts = HashMap::new();
        for result in self.client.classify_batch(&requests).await {
            if let Some(ClassificationPayload::Similarity { verdicts: batch }) = result.payload {
                for v in batch {
                    verdicts.insert((v.a, v.b), v);
                }
            }
        }
        verdicts
    }

    /// Merge `merged` into `survivor`, preserving the scope invariants.
    fn merge_nodes(&self, mut survivor: ThemeNode, mut merged: ThemeNode) -> ThemeNode {
        let union = survivor.scope.union(&merged.scope);
        let any_children = !survivor.children.is_empty() || !merged.children.is_empty();

        if any_children {
            // Leaves must keep partitioning the union, so a childless side
            // is carried as a leaf child instead of dissolving.
            if survivor.children.is_empty() {
                let mut own = ThemeNode::new(
                    self.ids.next(),
                    format!("{} (direct changes)", survivor.name),
                    survivor.scope.clone(),
                );
                own.description = survivor.description.clone();
                own.confidence = survivor.confidence;
                own.expansion = ExpansionState::Atomic {
                    reason: "carried through merge".to_string(),
                };
                own.parent = Some(survivor.id);
                own.level = survivor.level + 1;
                survivor.children.push(own);
            }
            if merged.children.is_empty() {
                merged.parent = Some(survivor.id);
                set_subtree_level(&mut merged, survivor.level + 1);
                survivor.children.push(merged.clone());
            } else {
                for mut child in std::mem::take(&mut merged.children) {
                    child.parent = Some(survivor.id);
                    set_subtree_level(&mut child, survivor.level + 1);
                    survivor.children.push(child);
                }
            }
            survivor.expansion = ExpansionState::Expanded;
        }

        survivor.scope = union;
        merge_description(&mut survivor.description, &merged.description);
        if survivor.business_context.is_empty() {
            survivor.business_context = merged.business_context.clone();
        }
        survivor.confidence = survivor.confidence.max(merged.confidence);
        for r in &merged.cross_refs {
            if r.target != survivor.id && !survivor.cross_refs.contains(r) {
                survivor.cross_refs.push(r.clone());
            }
        }
        survivor
    }

    /// Cross-level pass on one subtree: duplicates collapse toward the
    /// root at any distance, overlap collapses only across adjacent
    /// levels, distant overlap is linked.
    async fn cross_level(&self, root: &mut ThemeNode) {
        loop {
            let Some(action) = self.next_cross_action(root).await else {
                return;
            };
            match action {
                CrossAction::Collapse { ancestor, descendant } => {
                    if !collapse_descendant(root, ancestor, descendant) {
                        // Collapse would lose scope; link instead so the
                        // pair is not revisited.
                        link_pair(root, ancestor, descendant);
                    }
                }
                CrossAction::Link { ancestor, descendant } => {
                    link_pair(root, ancestor, descendant);
                }
            }
        }
    }

    async fn next_cross_action(&self, root: &ThemeNode) -> Option<CrossAction> {
        let linked = linked_pairs(root.walk().into_iter());
        let mut uncertain = Vec::new();

        for ancestor in root.walk() {
            for descendant in ancestor.walk() {
                if descendant.id == ancestor.id
                    || linked.contains(&(ancestor.id, descendant.id))
                {
                    continue;
                }
                let distance = descendant.level - ancestor.level;
                match prefilter(ancestor, descendant, &self.cfg) {
                    PreFilter::Merge => {
                        return Some(CrossAction::Collapse {
                            ancestor: ancestor.id,
                            descendant: descendant.id,
                        });
                    }
                    PreFilter::Distinct => {}
                    PreFilter::Uncertain => {
                        uncertain.push((ancestor.id, descendant.id, distance));
                    }
                }
            }
        }
        if uncertain.is_empty() {
            return None;
        }

        let by_id: HashMap<ThemeId, &ThemeNode> =
            root.walk().into_iter().map(|n| (n.id, n)).collect();
        let pairs: Vec<SimilarityPair> = uncertain
            .iter()
            .filter_map(|&(a, d, _)| Some(pair_for(by_id.get(&a)?, by_id.get(&d)?)))
            .collect();
        let verdicts = self.escalate(&pairs).await;

        for &(ancestor, descendant, distance) in &uncertain {
            let Some(v) = verdicts.get(&(ancestor, descendant)) else {
                continue;
            };
            if v.confidence < self.cfg.verdict_confidence_threshold {
                continue;
            }
            match v.verdict {
                Verdict::Duplicate => {
                    return Some(CrossAction::Collapse { ancestor, descendant });
                }
                Verdict::Overlap if distance == 1 => {
                    return Some(CrossAction::Collapse { ancestor, descendant });
                }
                Verdict::Overlap => {
                    return Some(CrossAction::Link { ancestor, descendant });
                }
                Verdict::Distinct => {}
            }
        }
        None
    }
}

fn pair_for(a: &ThemeNode, b: &ThemeNode) -> SimilarityPair {
    SimilarityPair {
        a: a.id,
        b: b.id,
        name_a: a.name.clone(),
        name_b: b.name.clone(),
        files_a: a.scope.files().into_iter().map(str::to_string).collect(),
        files_b: b.scope.files().into_iter().map(str::to_string).collect(),
        level_a: a.level,
        level_b: b.level,
    }
}

/// Pairs already joined by a cross-reference, in both orders.
fn linked_pairs<'a>(nodes: impl Iterator<Item = &'a ThemeNode>) -> HashSet<(ThemeId, ThemeId)> {
    let mut linked = HashSet::new();
    for node in nodes {
        for r in &node.cross_refs {
            linked.insert((node.id, r.target));
            linked.insert((r.target, node.id));
        }
    }
    linked
}

fn merge_description(into: &mut String, from: &str) {
    if from.is_empty() || from == into {
        return;
    }
    if into.is_empty() {
        into.push_str(from);
    } else {
        into.push_str("; ");
        into.push_str(from);
    }
}

fn cross_link(node: &mut ThemeNode, target: ThemeId) {
    let reference = CrossReference {
        label: "overlaps with".to_string(),
        target,
    };
    if !node.cross_refs.contains(&reference) {
        node.cross_refs.push(reference);
    }
}

fn set_subtree_level(node: &mut ThemeNode, level: usize) {
    node.level = level;
    let id = node.id;
    for child in &mut node.children {
        child.parent = Some(id);
        set_subtree_level(child, level + 1);
    }
}

fn find_mut(node: &mut ThemeNode, id: ThemeId) -> Option<&mut ThemeNode> {
    if node.id == id {
        return Some(node);
    }
    node.children.iter_mut().find_map(|c| find_mut(c, id))
}

/// Splice `descendant` out of the tree: its children take its place under
/// its parent and its description folds into `ancestor`. Returns false if
/// removing it would lose scope (a childless node with siblings).
fn collapse_descendant(root: &mut ThemeNode, ancestor: ThemeId, descendant: ThemeId) -> bool {
    let Some(parent_id) = find_mut(root, descendant).and_then(|d| d.parent) else {
        return false;
    };
    let removable = {
        let Some(parent) = find_mut(root, parent_id) else {
            return false;
        };
        match parent.children.iter().find(|c| c.id == descendant) {
            Some(desc) => !desc.children.is_empty() || parent.children.len() == 1,
            None => return false,
        }
    };
    if !removable {
        return false;
    }

    let desc = {
        let parent = find_mut(root, parent_id).expect("parent located above");
        let idx = parent
            .children
            .iter()
            .position(|c| c.id == descendant)
            .expect("descendant located above");
        let desc = parent.children.remove(idx);
        let parent_level = parent.level;
        for (offset, mut grandchild) in desc.children.clone().into_iter().enumerate() {
            grandchild.parent = Some(parent_id);
            set_subtree_level(&mut grandchild, parent_level + 1);
            parent.children.insert(idx + offset, grandchild);
        }
        if parent.children.is_empty() {
            // The spliced node was the only child; the parent turns leaf.
            parent.expansion = ExpansionState::Atomic {
                reason: "collapsed duplicate child".to_string(),
            };
        }
        desc
    };

    if let Some(anc) = find_mut(root, ancestor) {
        merge_description(&mut anc.description, &desc.description);
        anc.confidence = anc.confidence.max(desc.confidence);
    }
    log::debug!("collapsed {descendant} into {ancestor}");
    true
}

fn link_pair(root: &mut ThemeNode, a: ThemeId, b: ThemeId) {
    if let Some(node) = find_mut(root, a) {
        cross_link(node, b);
    }
    if let Some(node) = find_mut(root, b) {
        cross_link(node, a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use theme_classifier::test_support::ScriptedTransport;
    use theme_classifier::{CallGateway, ResponseCache};
    use theme_protocol::{CacheConfig, CodeScope, GatewayConfig, ScopeRange, ThemeForest};

    fn scope(ranges: &[(&str, usize, usize)]) -> CodeScope {
        CodeScope::new(
            ranges
                .iter()
                .map(|(f, s, e)| ScopeRange {
                    file: f.to_string(),
                    start_line: *s,
                    end_line: *e,
                })
                .collect(),
        )
    }

    fn theme(id: u64, name: &str, ranges: &[(&str, usize, usize)]) -> ThemeNode {
        ThemeNode::new(ThemeId(id), name, scope(ranges))
    }

    fn engine_with(transport: Arc<ScriptedTransport>) -> ConsolidationEngine {
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        let gateway = CallGateway::new(
            GatewayConfig {
                min_dispatch_interval_ms: 0,
                max_retries: 0,
                ..GatewayConfig::default()
            },
            transport as _,
        );
        let client = ClassificationClient::new(cache, gateway, false);
        ConsolidationEngine::new(
            client,
            ConsolidationConfig::default(),
            Arc::new(IdGen::starting_at(1000)),
        )
    }

    fn similarity_response(a: u64, b: u64, verdict: &str, confidence: f64) -> String {
        format!(
            r#"{{"verdicts":[{{"a":{a},"b":{b},"verdict":"{verdict}","confidence":{confidence}}}]}}"#
        )
    }

    #[tokio::test]
    async fn identical_names_merge_without_a_model_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine_with(Arc::clone(&transport));
        let forest = ThemeForest {
            roots: vec![
                theme(1, "Add input validation", &[("src/a.rs", 1, 10)]),
                theme(2, "Add input validation", &[("src/b.rs", 1, 5)]),
            ],
        };

        let out = engine.consolidate(forest).await;
        assert_eq!(out.roots.len(), 1);
        assert_eq!(out.roots[0].scope.line_count(), 15);
        assert_eq!(transport.calls(), 0, "pre-filter must not reach the model");
    }

    #[tokio::test]
    async fn disjoint_themes_are_left_alone() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine_with(Arc::clone(&transport));
        let forest = ThemeForest {
            roots: vec![
                theme(1, "Update styles", &[("web/app.css", 1, 10)]),
                theme(2, "Fix pointer math", &[("core/alloc.rs", 1, 10)]),
            ],
        };

        let out = engine.consolidate(forest).await;
        assert_eq!(out.roots.len(), 2);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn escalated_duplicate_verdict_merges_the_pair() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(&similarity_response(1, 2, "duplicate", 0.9));
        let engine = engine_with(Arc::clone(&transport));
        let forest = ThemeForest {
            roots: vec![
                theme(1, "Update parser", &[("src/parse.rs", 1, 20)]),
                theme(2, "Rework grammar handling", &[("src/lex.rs", 1, 20)]),
            ],
        };

        let out = engine.consolidate(forest).await;
        assert_eq!(out.roots.len(), 1);
        assert_eq!(out.roots[0].name, "Update parser");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn overlap_verdict_links_siblings_instead_of_merging() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(&similarity_response(1, 2, "overlap", 0.8));
        let engine = engine_with(Arc::clone(&transport));
        let forest = ThemeForest {
            roots: vec![
                theme(1, "Update parser", &[("src/parse.rs", 1, 20)]),
                theme(2, "Rework grammar handling", &[("src/lex.rs", 1, 20)]),
            ],
        };

        let out = engine.consolidate(forest).await;
        assert_eq!(out.roots.len(), 2);
        assert_eq!(out.roots[0].cross_refs.len(), 1);
        assert_eq!(out.roots[0].cross_refs[0].target, ThemeId(2));
        assert_eq!(out.roots[1].cross_refs[0].target, ThemeId(1));
    }

    #[tokio::test]
    async fn low_confidence_verdicts_are_ignored() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(&similarity_response(1, 2, "duplicate", 0.3));
        let engine = engine_with(Arc::clone(&transport));
        let forest = ThemeForest {
            roots: vec![
                theme(1, "Update parser", &[("src/parse.rs", 1, 20)]),
                theme(2, "Rework grammar handling", &[("src/lex.rs", 1, 20)]),
            ],
        };

        let out = engine.consolidate(forest).await;
        assert_eq!(out.roots.len(), 2);
        assert!(out.roots[0].cross_refs.is_empty());
    }

    #[tokio::test]
    async fn merging_into_a_parent_keeps_the_partition_valid() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine_with(transport);

        let mut survivor = theme(1, "Session handling", &[("src/auth.rs", 1, 20)]);
        for (id, (s, e)) in [(3u64, (1usize, 10usize)), (4, (11, 20))] {
            let mut child = theme(id, &format!("part {id}"), &[("src/auth.rs", s, e)]);
            child.parent = Some(ThemeId(1));
            child.level = 1;
            survivor.children.push(child);
        }
        survivor.expansion = ExpansionState::Expanded;
        let merged_away = theme(2, "Session handling", &[("src/session.rs", 1, 8)]);

        let out = engine
            .consolidate(ThemeForest {
                roots: vec![survivor, merged_away],
            })
            .await;
        assert_eq!(out.roots.len(), 1);
        assert_eq!(out.roots[0].children.len(), 3);
        assert_eq!(out.roots[0].scope.line_count(), 28);
        assert_eq!(out.validate(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn cross_level_duplicate_splices_the_descendant() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine_with(Arc::clone(&transport));

        let mut root = theme(
            1,
            "Session handling",
            &[("src/auth.rs", 1, 20), ("src/db.rs", 1, 5)],
        );
        let mut dup = theme(2, "Session handling", &[("src/auth.rs", 1, 20)]);
        dup.parent = Some(ThemeId(1));
        dup.level = 1;
        dup.description = "cookie refresh".to_string();
        for (id, (s, e)) in [(4u64, (1usize, 10usize)), (5, (11, 20))] {
            let mut grandchild = theme(id, &format!("part {id}"), &[("src/auth.rs", s, e)]);
            grandchild.parent = Some(ThemeId(2));
            grandchild.level = 2;
            dup.children.push(grandchild);
        }
        dup.expansion = ExpansionState::Expanded;
        let mut other = theme(3, "Schema migration", &[("src/db.rs", 1, 5)]);
        other.parent = Some(ThemeId(1));
        other.level = 1;
        root.children.push(dup);
        root.children.push(other);
        root.expansion = ExpansionState::Expanded;

        let out = engine.consolidate(ThemeForest { roots: vec![root] }).await;
        let root = &out.roots[0];
        assert_eq!(
            root.children.len(),
            3,
            "grandchildren moved up beside the sibling"
        );
        assert!(root.children.iter().all(|c| c.level == 1));
        assert!(root.description.contains("cookie refresh"));
        assert_eq!(out.validate(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn consolidation_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new());
        let engine = engine_with(transport);
        let forest = ThemeForest {
            roots: vec![
                theme(1, "Add input validation", &[("src/a.rs", 1, 10)]),
                theme(2, "Add input validation", &[("src/b.rs", 1, 5)]),
                theme(3, "Fix pointer math", &[("core/alloc.c", 1, 10)]),
            ],
        };

        let once = engine.consolidate(forest).await;
        let twice = engine.consolidate(once.clone()).await;
        assert_eq!(once, twice);
    }
}
