//! Whole-pipeline tests against transport doubles.

use std::sync::Arc;

use theme_classifier::test_support::{AlwaysExpandTransport, ScriptedTransport};
use theme_engine::{Analyzer, EngineError};
use theme_protocol::{
    AnalysisConfig, DiffFile, DiffHunk, DiffLine, ExpansionState, LineKind,
};

fn diff_file(path: &str, start: usize, changed: usize) -> DiffFile {
    DiffFile {
        path: path.to_string(),
        is_test: false,
        is_config: false,
        hunks: vec![DiffHunk {
            start_line: start,
            lines: (0..changed)
                .map(|i| DiffLine {
                    kind: LineKind::Added,
                    content: format!("line {i}"),
                })
                .collect(),
        }],
    }
}

fn fast_config() -> AnalysisConfig {
    let mut cfg = AnalysisConfig::standard();
    cfg.gateway.min_dispatch_interval_ms = 0;
    cfg.gateway.max_retries = 0;
    cfg.gateway.backoff_base_ms = 1;
    cfg
}

#[tokio::test]
async fn always_expanding_model_still_terminates_within_the_depth_ceiling() {
    let analyzer = Analyzer::new(fast_config(), Arc::new(AlwaysExpandTransport));
    let diff = vec![
        diff_file("src/auth.rs", 1, 40),
        diff_file("src/db.rs", 10, 35),
        diff_file("web/app.ts", 1, 30),
        diff_file("web/router.ts", 5, 25),
    ];

    let forest = analyzer.run(&diff).await.expect("analysis completes");
    assert!(!forest.roots.is_empty());
    assert_eq!(forest.validate(), Vec::<String>::new());
    for root in &forest.roots {
        assert!(
            root.max_depth() <= 10,
            "depth {} exceeds the ceiling",
            root.max_depth()
        );
    }
    // Every leaf must end in an explicit terminal state.
    for root in &forest.roots {
        for leaf in root.leaves() {
            assert!(
                matches!(leaf.expansion, ExpansionState::Atomic { .. }),
                "leaf {} left in state {:?}",
                leaf.id,
                leaf.expansion
            );
        }
    }
}

#[tokio::test]
async fn tiny_single_file_diff_is_atomic_without_any_model_call() {
    let transport = Arc::new(ScriptedTransport::new());
    let analyzer = Analyzer::new(fast_config(), transport.clone() as _);
    let diff = vec![diff_file("src/util.rs", 42, 3)];

    let forest = analyzer.run(&diff).await.expect("analysis completes");
    assert_eq!(forest.roots.len(), 1);
    let root = &forest.roots[0];
    assert!(root.children.is_empty());
    match &root.expansion {
        ExpansionState::Atomic { reason } => {
            assert!(reason.contains("3 changed lines"), "reason: {reason}");
        }
        other => panic!("expected atomic root, got {other:?}"),
    }
    assert_eq!(transport.calls(), 0, "small diffs must not reach the model");
}

#[tokio::test]
async fn empty_diff_is_rejected_up_front() {
    let transport = Arc::new(ScriptedTransport::new());
    let analyzer = Analyzer::new(fast_config(), transport.clone() as _);

    let err = analyzer.run(&[]).await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyDiff));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn unreachable_model_still_yields_a_valid_forest_via_fallback() {
    // Every call fails permanently; the heuristic fallback must carry the
    // run to a structurally valid result.
    let transport = Arc::new(
        ScriptedTransport::new().with_default(Err(
            theme_classifier::TransportError::Auth("no credentials".to_string()),
        )),
    );
    let analyzer = Analyzer::new(fast_config(), transport as _);
    let diff = vec![
        diff_file("src/auth.rs", 1, 40),
        diff_file("src/db.rs", 10, 35),
    ];

    let forest = analyzer.run(&diff).await.expect("fallback keeps the run alive");
    assert_eq!(forest.validate(), Vec::<String>::new());
    assert_eq!(forest.roots.len(), 1);
}

#[tokio::test]
async fn repeated_runs_share_the_response_cache() {
    let transport = Arc::new(ScriptedTransport::new().with_default(Ok(
        r#"{"expand": false, "confidence": 0.9}"#.to_string(),
    )));
    let analyzer = Analyzer::new(fast_config(), transport.clone() as _);
    let diff = vec![
        diff_file("src/auth.rs", 1, 40),
        diff_file("src/db.rs", 10, 35),
    ];

    analyzer.run(&diff).await.expect("first run");
    let calls_after_first = transport.calls();
    analyzer.run(&diff).await.expect("second run");
    assert_eq!(
        transport.calls(),
        calls_after_first,
        "identical requests must be served from the cache"
    );
    assert!(analyzer.cache_snapshot().hits > 0);
}
