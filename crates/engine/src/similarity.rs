//! Cheap similarity pre-filter, no model calls.
//!
//! Obvious duplicates merge immediately; obviously unrelated pairs are
//! kept apart; everything in between is escalated to a model-backed
//! similarity request by the consolidation engine.

use std::collections::BTreeSet;

use theme_protocol::{ConsolidationConfig, ThemeNode};

/// Decision of the pre-filter alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFilter {
    /// Near-identical names; merge without consulting the model.
    Merge,
    /// No shared files and disjoint file types; keep distinct.
    Distinct,
    /// Escalate to a model-backed similarity request.
    Uncertain,
}

/// Token set of a theme name: lowercase alphanumeric runs.
fn name_tokens(name: &str) -> BTreeSet<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Name-token Jaccard similarity of two themes.
pub fn name_similarity(a: &ThemeNode, b: &ThemeNode) -> f64 {
    jaccard(&name_tokens(&a.name), &name_tokens(&b.name))
}

/// Jaccard overlap of the affected-file sets.
pub fn file_overlap(a: &ThemeNode, b: &ThemeNode) -> f64 {
    let fa: BTreeSet<&str> = a.scope.files();
    let fb: BTreeSet<&str> = b.scope.files();
    jaccard(&fa, &fb)
}

/// Do the two themes share any file extension?
pub fn extensions_overlap(a: &ThemeNode, b: &ThemeNode) -> bool {
    let ea = a.scope.extensions();
    let eb = b.scope.extensions();
    !ea.is_disjoint(&eb)
}

/// Apply the pre-filter decision policy to a pair.
pub fn prefilter(a: &ThemeNode, b: &ThemeNode, cfg: &ConsolidationConfig) -> PreFilter {
    if name_similarity(a, b) >= cfg.name_merge_threshold {
        return PreFilter::Merge;
    }
    if file_overlap(a, b) == 0.0 && !extensions_overlap(a, b) {
        return PreFilter::Distinct;
    }
    PreFilter::Uncertain
}
