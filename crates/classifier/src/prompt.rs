//! Prompt rendering for classification requests.
//!
//! The exact wording is a presentation concern; what matters here is that
//! the rendered text is deterministic for a given request (it feeds the
//! cache key indirectly via the request parameters) and that it declares
//! the JSON shape the extractor will look for.

use theme_protocol::{ClassificationKind, ClassificationRequest};

/// Render the outgoing prompt text for a request.
pub fn render(request: &ClassificationRequest) -> String {
    let mut out = String::new();
    out.push_str("KIND: ");
    out.push_str(request.kind.as_str());
    out.push('\n');
    for (key, value) in &request.params {
        out.push_str(&key.to_ascii_uppercase());
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    match request.kind {
        ClassificationKind::Expansion => {
            out.push_str(
                "Decide whether this change theme should be decomposed into \
                 sub-themes. Each child must own a non-empty, non-overlapping \
                 slice of the parent scope, and together the children must \
                 cover it exactly.\n\
                 Respond with JSON only: {\"expand\": bool, \"confidence\": \
                 number, \"children\": [{\"name\": string, \"description\": \
                 string, \"scope\": {\"ranges\": [{\"file\": string, \
                 \"start_line\": number, \"end_line\": number}]}}], \
                 \"business_context\": string, \"technical_context\": string}\n",
            );
        }
        ClassificationKind::Similarity => {
            out.push_str(
                "Judge each listed theme pair: duplicate (same concern), \
                 overlap (related concern), or distinct.\n\
                 Respond with JSON only: {\"verdicts\": [{\"a\": number, \
                 \"b\": number, \"verdict\": \"duplicate\"|\"overlap\"|\
                 \"distinct\", \"confidence\": number}]}\n",
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use theme_protocol::ClassificationRequest;

    #[test]
    fn render_is_deterministic_and_carries_params() {
        let req = ClassificationRequest::new(ClassificationKind::Expansion)
            .with_param("name", "Auth refactor")
            .with_param("scope_json", r#"{"ranges":[]}"#);
        let a = render(&req);
        let b = render(&req);
        assert_eq!(a, b);
        assert!(a.starts_with("KIND: expansion\n"));
        assert!(a.contains("NAME: Auth refactor"));
        assert!(a.contains("SCOPE_JSON: "));
    }
}
