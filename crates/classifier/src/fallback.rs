//! Heuristic stand-in for the model-backed classifier.
//!
//! Activated only when the model path fails in a non-retryable way or
//! exhausts its retries. Output is schema-compatible with the model path;
//! the only visible difference to callers is the discounted confidence and
//! the `fallback` origin tag.

use std::collections::BTreeSet;

use theme_protocol::{
    ChildSpec, ClassificationKind, ClassificationPayload, ClassificationRequest, CodeScope,
    ExpansionDecision, SimilarityPair, SimilarityVerdict, Verdict,
};

/// Cap on any confidence the heuristic path reports.
const FALLBACK_CONFIDENCE_CAP: f64 = 0.55;
const EXPAND_CONFIDENCE: f64 = 0.4;
const KEEP_CONFIDENCE: f64 = 0.45;

/// Keyword table mapping change vocabulary to business context labels.
static BUSINESS_PATTERNS: &[(&str, &str)] = &[
    ("auth", "Authentication and access control"),
    ("login", "Authentication and access control"),
    ("permission", "Authorization rules"),
    ("cache", "Caching and performance"),
    ("perf", "Performance tuning"),
    ("test", "Test coverage"),
    ("config", "Configuration management"),
    ("migrat", "Data migration"),
    ("schema", "Data model changes"),
    ("api", "API surface changes"),
    ("endpoint", "API surface changes"),
    ("valid", "Input validation"),
    ("error", "Error handling"),
    ("log", "Observability"),
    ("metric", "Observability"),
    ("refactor", "Internal refactoring"),
    ("rename", "Internal refactoring"),
    ("doc", "Documentation"),
    ("ui", "User interface"),
    ("security", "Security hardening"),
];

/// Keyword/Levenshtein substitute for the model-backed classifier.
pub struct FallbackAnalyzer;

impl FallbackAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Produce a reduced-confidence payload for the request, or `None` when
    /// the parameters are too malformed to interpret.
    pub fn analyze(&self, request: &ClassificationRequest) -> Option<ClassificationPayload> {
        match request.kind {
            ClassificationKind::Expansion => self.expansion(request),
            ClassificationKind::Similarity => self.similarity(request),
        }
    }

    fn expansion(&self, request: &ClassificationRequest) -> Option<ClassificationPayload> {
        let scope: CodeScope =
            serde_json::from_str(request.params.get("scope_json")?).ok()?;
        let name = request.params.get("name").cloned().unwrap_or_default();
        let description = request
            .params
            .get("description")
            .cloned()
            .unwrap_or_default();
        let business = business_context_for(&format!("{name} {description}"))
            .unwrap_or("General code changes")
            .to_string();

        let files: Vec<String> =
            scope.files().into_iter().map(str::to_string).collect();
        if files.len() < 2 {
            return Some(ClassificationPayload::Expansion(ExpansionDecision {
                expand: false,
                confidence: KEEP_CONFIDENCE,
                children: vec![],
                business_context: business,
                technical_context: "single-file change kept whole".to_string(),
            }));
        }

        // Per-file split is always a valid partition of the parent scope.
        let children: Vec<ChildSpec> = files
            .iter()
            .map(|file| {
                let ranges = scope
                    .ranges
                    .iter()
                    .filter(|r| &r.file == file)
                    .cloned()
                    .collect();
                ChildSpec {
                    name: child_name_for(file),
                    description: format!("changes in {file}"),
                    scope: CodeScope::new(ranges),
                }
            })
            .collect();

        Some(ClassificationPayload::Expansion(ExpansionDecision {
            expand: true,
            confidence: EXPAND_CONFIDENCE,
            children,
            business_context: business,
            technical_context: "keyword-based per-file split".to_string(),
        }))
    }

    fn similarity(&self, request: &ClassificationRequest) -> Option<ClassificationPayload> {
        let pairs: Vec<SimilarityPair> =
            serde_json::from_str(request.params.get("pairs_json")?).ok()?;
        let verdicts = pairs
            .iter()
            .map(|pair| {
                let name_sim = normalized_levenshtein(
                    &pair.name_a.to_lowercase(),
                    &pair.name_b.to_lowercase(),
                );
                let file_overlap = jaccard(&pair.files_a, &pair.files_b);
                let verdict = if name_sim >= 0.85 {
                    Verdict::Duplicate
                } else if name_sim >= 0.5 && file_overlap > 0.0 {
                    Verdict::Overlap
                } else {
                    Verdict::Distinct
                };
                SimilarityVerdict {
                    a: pair.a,
                    b: pair.b,
                    verdict,
                    confidence: (0.3 + 0.3 * name_sim).min(FALLBACK_CONFIDENCE_CAP),
                }
            })
            .collect();
        Some(ClassificationPayload::Similarity { verdicts })
    }
}

impl Default for FallbackAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// First keyword table hit for the text, if any.
pub fn business_context_for(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    BUSINESS_PATTERNS
        .iter()
        .find(|(pat, _)| lower.contains(pat))
        .map(|(_, label)| *label)
}

fn child_name_for(file: &str) -> String {
    let stem = file
        .rsplit('/')
        .next()
        .unwrap_or(file)
        .split('.')
        .next()
        .unwrap_or(file);
    format!("Changes to {stem}")
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let sb: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

/// Classic dynamic-programming edit distance, rolling single row.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![i + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current.push(
                (prev[j] + cost)
                    .min(prev[j + 1] + 1)
                    .min(current[j] + 1),
            );
        }
        prev = current;
    }
    prev[b.len()]
}

/// Edit-distance similarity scaled to [0, 1].
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let max = a.chars().count().max(b.chars().count());
    if max == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max as f64
}
