use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque theme identifier, unique within one analysis run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThemeId(pub u64);

impl fmt::Display for ThemeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Inclusive line range a theme owns within one file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeRange {
    pub file: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl ScopeRange {
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn overlaps(&self, other: &ScopeRange) -> bool {
        self.file == other.file
            && self.start_line <= other.end_line
            && other.start_line <= self.end_line
    }
}

/// Ordered set of (file, line range) slices a theme owns.
///
/// Scope ownership is exclusive within a tree level: sibling scopes never
/// overlap, and the union of children scopes equals the parent scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeScope {
    pub ranges: Vec<ScopeRange>,
}

impl CodeScope {
    pub fn new(mut ranges: Vec<ScopeRange>) -> Self {
        ranges.sort();
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of owned lines.
    pub fn line_count(&self) -> usize {
        self.ranges.iter().map(ScopeRange::line_count).sum()
    }

    /// Set of files this scope touches.
    pub fn files(&self) -> BTreeSet<&str> {
        self.ranges.iter().map(|r| r.file.as_str()).collect()
    }

    /// Lowercased file extensions present in this scope.
    pub fn extensions(&self) -> BTreeSet<String> {
        self.files()
            .iter()
            .filter_map(|f| f.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
            .collect()
    }

    pub fn overlaps(&self, other: &CodeScope) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.overlaps(b)))
    }

    /// Union of two scopes, with adjacent/overlapping ranges in the same
    /// file coalesced.
    pub fn union(&self, other: &CodeScope) -> CodeScope {
        let mut ranges: Vec<ScopeRange> = self
            .ranges
            .iter()
            .chain(other.ranges.iter())
            .cloned()
            .collect();
        ranges.sort();
        let mut merged: Vec<ScopeRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last)
                    if last.file == r.file && r.start_line <= last.end_line + 1 =>
                {
                    last.end_line = last.end_line.max(r.end_line);
                }
                _ => merged.push(r),
            }
        }
        CodeScope { ranges: merged }
    }

    /// Exact per-line ownership map, used for partition validation.
    fn line_set(&self) -> BTreeMap<(&str, usize), usize> {
        let mut lines: BTreeMap<(&str, usize), usize> = BTreeMap::new();
        for r in &self.ranges {
            for line in r.start_line..=r.end_line {
                *lines.entry((r.file.as_str(), line)).or_insert(0) += 1;
            }
        }
        lines
    }

    /// True when `parts` cover exactly this scope with each line owned by
    /// exactly one part.
    pub fn is_partitioned_by(&self, parts: &[&CodeScope]) -> bool {
        let own = self.line_set();
        let mut seen: BTreeMap<(&str, usize), usize> = BTreeMap::new();
        for part in parts {
            for (key, count) in part.line_set() {
                *seen.entry(key).or_insert(0) += count;
            }
        }
        if own.keys().ne(seen.keys()) {
            return false;
        }
        own.values().all(|c| *c == 1) && seen.values().all(|c| *c == 1)
    }
}

/// Expansion lifecycle of a theme node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExpansionState {
    /// Not yet considered for decomposition.
    Unevaluated,
    /// Judged indivisible; terminal. The reason is kept for reporting.
    Atomic { reason: String },
    /// Decomposed into children.
    Expanded,
}

/// Non-owning named link to another theme.
///
/// Cross-references never carry scope and do not affect tree shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub label: String,
    pub target: ThemeId,
}

/// A coherent, named unit of code change positioned in a hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeNode {
    pub id: ThemeId,
    pub parent: Option<ThemeId>,
    /// Root = 0; child = parent.level + 1.
    pub level: usize,

    pub name: String,
    pub description: String,
    #[serde(default)]
    pub business_context: String,
    #[serde(default)]
    pub technical_context: String,
    /// Classification confidence in [0, 1].
    pub confidence: f64,

    pub scope: CodeScope,
    pub children: Vec<ThemeNode>,
    #[serde(default)]
    pub cross_refs: Vec<CrossReference>,
    pub expansion: ExpansionState,
}

impl ThemeNode {
    pub fn new(id: ThemeId, name: impl Into<String>, scope: CodeScope) -> Self {
        Self {
            id,
            parent: None,
            level: 0,
            name: name.into(),
            description: String::new(),
            business_context: String::new(),
            technical_context: String::new(),
            confidence: 0.0,
            scope,
            children: Vec::new(),
            cross_refs: Vec::new(),
            expansion: ExpansionState::Unevaluated,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Set of files affected by this theme, derived from scope.
    pub fn affected_files(&self) -> BTreeSet<&str> {
        self.scope.files()
    }

    /// Leaf descendants, or the node itself when it has no children.
    pub fn leaves(&self) -> Vec<&ThemeNode> {
        if self.children.is_empty() {
            return vec![self];
        }
        self.children.iter().flat_map(ThemeNode::leaves).collect()
    }

    /// Depth-first iteration over this node and all descendants.
    pub fn walk(&self) -> Vec<&ThemeNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ThemeNode::node_count).sum::<usize>()
    }

    pub fn max_depth(&self) -> usize {
        self.children
            .iter()
            .map(ThemeNode::max_depth)
            .max()
            .unwrap_or(self.level)
    }
}

/// Final output of an analysis run: the root themes with their subtrees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThemeForest {
    pub roots: Vec<ThemeNode>,
}

impl ThemeForest {
    pub fn node_count(&self) -> usize {
        self.roots.iter().map(ThemeNode::node_count).sum()
    }

    /// Check the structural invariants of §data-model on every node:
    /// monotonic levels, parent back-links, and leaf scopes partitioning
    /// each interior node's scope. Returns human-readable violations.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for root in &self.roots {
            if root.level != 0 {
                violations.push(format!("root {} has level {}", root.id, root.level));
            }
            if root.parent.is_some() {
                violations.push(format!("root {} has a parent", root.id));
            }
            validate_node(root, &mut violations);
        }
        violations
    }
}

fn validate_node(node: &ThemeNode, violations: &mut Vec<String>) {
    for child in &node.children {
        if child.level != node.level + 1 {
            violations.push(format!(
                "child {} of {} has level {}, expected {}",
                child.id,
                node.id,
                child.level,
                node.level + 1
            ));
        }
        if child.parent != Some(node.id) {
            violations.push(format!(
                "child {} of {} has parent {:?}",
                child.id, node.id, child.parent
            ));
        }
        validate_node(child, violations);
    }
    if !node.children.is_empty() {
        let leaf_scopes: Vec<&CodeScope> =
            node.leaves().into_iter().map(|l| &l.scope).collect();
        if !node.scope.is_partitioned_by(&leaf_scopes) {
            violations.push(format!(
                "leaf scopes under {} do not partition its own scope",
                node.id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn range(file: &str, start: usize, end: usize) -> ScopeRange {
        ScopeRange {
            file: file.to_string(),
            start_line: start,
            end_line: end,
        }
    }

    #[test]
    fn union_coalesces_adjacent_ranges() {
        let a = CodeScope::new(vec![range("a.rs", 1, 5)]);
        let b = CodeScope::new(vec![range("a.rs", 6, 9), range("b.rs", 1, 2)]);
        let u = a.union(&b);
        assert_eq!(
            u.ranges,
            vec![range("a.rs", 1, 9), range("b.rs", 1, 2)]
        );
        assert_eq!(u.line_count(), 11);
    }

    #[test]
    fn partition_detects_gaps_and_overlaps() {
        let parent = CodeScope::new(vec![range("a.rs", 1, 10)]);
        let left = CodeScope::new(vec![range("a.rs", 1, 5)]);
        let right = CodeScope::new(vec![range("a.rs", 6, 10)]);
        let overlapping = CodeScope::new(vec![range("a.rs", 5, 10)]);
        let short = CodeScope::new(vec![range("a.rs", 6, 9)]);

        assert!(parent.is_partitioned_by(&[&left, &right]));
        assert!(!parent.is_partitioned_by(&[&left, &overlapping]));
        assert!(!parent.is_partitioned_by(&[&left, &short]));
        assert!(!parent.is_partitioned_by(&[&left]));
    }

    #[test]
    fn forest_validation_flags_bad_levels() {
        let scope = CodeScope::new(vec![range("a.rs", 1, 4)]);
        let mut root = ThemeNode::new(ThemeId(1), "root", scope.clone());
        let mut child = ThemeNode::new(ThemeId(2), "child", scope);
        child.parent = Some(ThemeId(1));
        child.level = 2; // wrong: should be 1
        root.children.push(child);
        root.expansion = ExpansionState::Expanded;

        let forest = ThemeForest { roots: vec![root] };
        let violations = forest.validate();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("expected 1"));
    }

    #[test]
    fn forest_validation_accepts_well_formed_tree() {
        let parent_scope = CodeScope::new(vec![range("a.rs", 1, 10)]);
        let mut root = ThemeNode::new(ThemeId(1), "root", parent_scope);
        for (i, (s, e)) in [(1usize, 5usize), (6, 10)].iter().enumerate() {
            let mut child = ThemeNode::new(
                ThemeId(2 + i as u64),
                format!("child{i}"),
                CodeScope::new(vec![range("a.rs", *s, *e)]),
            );
            child.parent = Some(ThemeId(1));
            child.level = 1;
            root.children.push(child);
        }
        root.expansion = ExpansionState::Expanded;
        let forest = ThemeForest { roots: vec![root] };
        assert!(forest.validate().is_empty());
    }
}
