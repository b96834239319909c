//! End-to-end analysis pipeline.
//!
//! One `Analyzer` owns one gateway/cache/ledger generation. Roots are
//! seeded from the diff by top-level directory, decomposed concurrently,
//! then consolidated into the final forest.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::breaker::ExpansionBreaker;
use crate::consolidate::ConsolidationEngine;
use crate::decompose::{DecompositionEngine, IdGen};
use crate::error::{EngineError, Result};
use crate::ledger::{BreakerSnapshot, ExpansionLedger};
use theme_classifier::fallback::business_context_for;
use theme_classifier::{
    CacheSnapshot, CallGateway, ClassificationClient, GatewaySnapshot, ModelTransport,
    ResponseCache,
};
use theme_protocol::{
    AnalysisConfig, CodeScope, DiffFile, ScopeRange, ThemeForest, ThemeNode,
};

pub struct Analyzer {
    client: ClassificationClient,
    ledger: Arc<ExpansionLedger>,
    ids: Arc<IdGen>,
    decomposer: DecompositionEngine,
    consolidator: ConsolidationEngine,
}

impl Analyzer {
    pub fn new(cfg: AnalysisConfig, transport: Arc<dyn ModelTransport>) -> Self {
        let cache = Arc::new(ResponseCache::new(cfg.cache));
        let gateway = CallGateway::new(cfg.gateway, transport);
        let client = ClassificationClient::new(cache, gateway, cfg.fallback_enabled);
        let ledger = Arc::new(ExpansionLedger::new());
        let breaker = Arc::new(ExpansionBreaker::new(cfg.breaker, Arc::clone(&ledger)));
        let ids = Arc::new(IdGen::starting_at(1));
        let decomposer =
            DecompositionEngine::new(client.clone(), breaker, Arc::clone(&ids));
        let consolidator =
            ConsolidationEngine::new(client.clone(), cfg.consolidation, Arc::clone(&ids));
        Self {
            client,
            ledger,
            ids,
            decomposer,
            consolidator,
        }
    }

    /// Run the full pipeline over a pre-parsed diff.
    pub async fn run(&self, diff: &[DiffFile]) -> Result<ThemeForest> {
        self.ledger.reset();
        let seeds = seed_roots(diff, &self.ids)?;
        log::info!(
            "analyzing {} changed files as {} root themes",
            diff.len(),
            seeds.len()
        );

        let mut handles = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let engine = self.decomposer.clone();
            handles.push(tokio::spawn(
                async move { engine.expand_root(seed).await },
            ));
        }
        let mut roots = Vec::with_capacity(handles.len());
        for handle in handles {
            roots.push(handle.await.expect("root expansion task panicked"));
        }

        let forest = self.consolidator.consolidate(ThemeForest { roots }).await;
        for violation in forest.validate() {
            log::warn!("forest invariant violated: {violation}");
        }
        log::info!(
            "analysis produced {} themes across {} roots",
            forest.node_count(),
            forest.roots.len()
        );
        Ok(forest)
    }

    pub fn gateway_snapshot(&self) -> GatewaySnapshot {
        self.client.gateway().snapshot()
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.client.cache().snapshot()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.ledger.snapshot()
    }
}

/// Group changed files by top-level directory into root themes.
///
/// Each group's scope is the union of its hunk ranges, so the roots
/// partition the diff among themselves by construction.
fn seed_roots(diff: &[DiffFile], ids: &IdGen) -> Result<Vec<ThemeNode>> {
    if diff.iter().map(DiffFile::changed_line_count).sum::<usize>() == 0 {
        return Err(EngineError::EmptyDiff);
    }

    let mut groups: BTreeMap<&str, Vec<&DiffFile>> = BTreeMap::new();
    for file in diff {
        if file.hunks.is_empty() {
            continue;
        }
        let group = match file.path.split_once('/') {
            Some((dir, _)) => dir,
            None => "top level",
        };
        groups.entry(group).or_default().push(file);
    }

    let mut roots = Vec::with_capacity(groups.len());
    for (group, files) in groups {
        let ranges: Vec<ScopeRange> = files
            .iter()
            .flat_map(|f| {
                f.hunks.iter().map(|h| {
                    let (start_line, end_line) = h.line_range();
                    ScopeRange {
                        file: f.path.clone(),
                        start_line,
                        end_line,
                    }
                })
            })
            .collect();
        let changed: usize = files.iter().map(|f| f.changed_line_count()).sum();

        let name = if group == "top level" {
            "Top-level changes".to_string()
        } else {
            format!("Changes under {group}")
        };
        let mut root = ThemeNode::new(ids.next(), name, CodeScope::new(ranges));
        root.description = format!("{} files, {changed} changed lines", files.len());
        if files.iter().all(|f| f.is_test) {
            root.business_context = "Test coverage".to_string();
        } else if let Some(label) = files
            .iter()
            .find_map(|f| business_context_for(&f.path))
        {
            root.business_context = label.to_string();
        }
        roots.push(root);
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use theme_protocol::{DiffHunk, DiffLine, LineKind};

    fn file(path: &str, start: usize, changed: usize) -> DiffFile {
        DiffFile {
            path: path.to_string(),
            is_test: false,
            is_config: false,
            hunks: vec![DiffHunk {
                start_line: start,
                lines: (0..changed)
                    .map(|_| DiffLine {
                        kind: LineKind::Added,
                        content: "x".to_string(),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn roots_group_files_by_top_level_directory() {
        let diff = vec![
            file("src/auth.rs", 1, 5),
            file("src/db.rs", 1, 3),
            file("web/app.ts", 1, 4),
            file("README.md", 1, 2),
        ];
        let ids = IdGen::starting_at(1);
        let roots = seed_roots(&diff, &ids).unwrap();

        let names: Vec<&str> = roots.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Changes under src", "Top-level changes", "Changes under web"]
        );
        let src = &roots[0];
        assert_eq!(src.scope.files().len(), 2);
        assert!(src.description.contains("2 files"));
    }

    #[test]
    fn seeding_rejects_a_diff_with_no_changed_lines() {
        let diff = vec![DiffFile {
            path: "src/a.rs".to_string(),
            is_test: false,
            is_config: false,
            hunks: vec![],
        }];
        let ids = IdGen::starting_at(1);
        assert!(matches!(
            seed_roots(&diff, &ids),
            Err(EngineError::EmptyDiff)
        ));
        assert!(matches!(seed_roots(&[], &ids), Err(EngineError::EmptyDiff)));
    }

    #[test]
    fn auth_paths_pick_up_a_business_label() {
        let diff = vec![file("src/auth.rs", 1, 5)];
        let ids = IdGen::starting_at(1);
        let roots = seed_roots(&diff, &ids).unwrap();
        assert_eq!(roots[0].business_context, "Authentication and access control");
    }
}
