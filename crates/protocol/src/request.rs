use crate::theme::{CodeScope, ThemeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Kind of decision requested from the classifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    /// Should this theme expand, and into which children?
    Expansion,
    /// Batched pairwise similarity verdicts for consolidation.
    Similarity,
}

impl ClassificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationKind::Expansion => "expansion",
            ClassificationKind::Similarity => "similarity",
        }
    }
}

/// Queue ordering hint. Retries re-entering at the queue front outrank
/// any priority here.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// A typed request to the classification layer.
///
/// Identity for caching and dedup is a deterministic hash of the kind and
/// the canonicalized (sorted-key) parameter map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub kind: ClassificationKind,
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: RequestPriority,
}

impl ClassificationRequest {
    pub fn new(kind: ClassificationKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
            priority: RequestPriority::Normal,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Deterministic cache key over (kind, canonicalized parameters).
    ///
    /// BTreeMap iteration is already key-sorted, so the digest input is
    /// canonical without an extra sort.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        for (k, v) in &self.params {
            hasher.update([0u8]);
            hasher.update(k.as_bytes());
            hasher.update([1u8]);
            hasher.update(v.as_bytes());
        }
        let digest = hasher.finalize();
        format!("{}:{:x}", self.kind.as_str(), digest)
    }
}

/// Provenance of a classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Fresh,
    Cached,
    Fallback,
}

/// A suggested child in an expansion decision.
///
/// Scope must be a non-empty slice of the parent's scope; the engine
/// validates the full partition before accepting the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub scope: CodeScope,
}

/// Answer to an `Expansion` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionDecision {
    pub expand: bool,
    pub confidence: f64,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
    #[serde(default)]
    pub business_context: String,
    #[serde(default)]
    pub technical_context: String,
}

/// Similarity verdict for one theme pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Same concern; merge (or collapse across levels).
    Duplicate,
    /// Related concerns; merge only when the pair is at adjacent levels.
    Overlap,
    /// Keep both.
    Distinct,
}

/// One theme pair as handed to a similarity request (`pairs_json` param).
///
/// Carries just enough for both the model prompt and the heuristic
/// fallback to judge the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityPair {
    pub a: ThemeId,
    pub b: ThemeId,
    pub name_a: String,
    pub name_b: String,
    #[serde(default)]
    pub files_a: Vec<String>,
    #[serde(default)]
    pub files_b: Vec<String>,
    /// Levels of the two themes; nonzero distance marks a cross-level pair.
    #[serde(default)]
    pub level_a: usize,
    #[serde(default)]
    pub level_b: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityVerdict {
    pub a: ThemeId,
    pub b: ThemeId,
    pub verdict: Verdict,
    pub confidence: f64,
}

/// Typed payload of a classification result, one variant per request kind.
///
/// Callers pattern-match on the variant; the extractor boundary is the only
/// place raw model text is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationPayload {
    Expansion(ExpansionDecision),
    Similarity { verdicts: Vec<SimilarityVerdict> },
}

impl ClassificationPayload {
    /// Approximate in-memory size, used for the cache byte budget.
    pub fn approx_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(256)
    }

    pub fn kind(&self) -> ClassificationKind {
        match self {
            ClassificationPayload::Expansion(_) => ClassificationKind::Expansion,
            ClassificationPayload::Similarity { .. } => ClassificationKind::Similarity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cache_key_is_order_insensitive() {
        let a = ClassificationRequest::new(ClassificationKind::Expansion)
            .with_param("name", "Auth refactor")
            .with_param("files", "src/auth.rs");
        let b = ClassificationRequest::new(ClassificationKind::Expansion)
            .with_param("files", "src/auth.rs")
            .with_param("name", "Auth refactor");
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_separates_kinds_and_params() {
        let a = ClassificationRequest::new(ClassificationKind::Expansion)
            .with_param("name", "x");
        let b = ClassificationRequest::new(ClassificationKind::Similarity)
            .with_param("name", "x");
        assert_ne!(a.cache_key(), b.cache_key());

        // Key/value boundary must matter: ("ab","c") != ("a","bc").
        let c = ClassificationRequest::new(ClassificationKind::Expansion)
            .with_param("ab", "c");
        let d = ClassificationRequest::new(ClassificationKind::Expansion)
            .with_param("a", "bc");
        assert_ne!(c.cache_key(), d.cache_key());
    }
}
