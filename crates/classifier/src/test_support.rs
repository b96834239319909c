//! Transport doubles shared by this crate's tests and `theme-engine`'s
//! integration tests. Compiled into the crate so downstream test code can
//! link against them directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::TransportError;
use crate::transport::ModelTransport;
use theme_protocol::CodeScope;

/// Replays a scripted sequence of transport outcomes, tracking call and
/// concurrency counts for assertions.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<String, TransportError>>>,
    /// Returned once the script is exhausted.
    default_response: Result<String, TransportError>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: Err(TransportError::Io("script exhausted".to_string())),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_default(mut self, response: Result<String, TransportError>) -> Self {
        self.default_response = response;
        self
    }

    /// Artificial per-call latency, used to observe concurrency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.script
            .lock()
            .expect("script mutex")
            .push_back(Ok(text.into()));
    }

    pub fn push_err(&self, err: TransportError) {
        self.script.lock().expect("script mutex").push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn complete(&self, _prompt: &str) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        let scripted = self.script.lock().expect("script mutex").pop_front();
        scripted.unwrap_or_else(|| self.default_response.clone())
    }
}

/// Answers every expansion request with "expand", splitting the parent
/// scope into a valid child partition. Used to prove termination is the
/// engine's property, not the model's.
pub struct AlwaysExpandTransport;

#[async_trait]
impl ModelTransport for AlwaysExpandTransport {
    async fn complete(&self, prompt: &str) -> Result<String, TransportError> {
        let scope = scope_from_prompt(prompt)
            .ok_or_else(|| TransportError::MalformedRequest("no scope in prompt".into()))?;
        let children: Vec<serde_json::Value> = split_scope(&scope)
            .into_iter()
            .enumerate()
            .map(|(i, part)| {
                json!({
                    "name": format!("part {i}"),
                    "description": "mechanical split",
                    "scope": part,
                })
            })
            .collect();
        Ok(json!({
            "expand": true,
            "confidence": 0.99,
            "children": children,
            "business_context": "",
            "technical_context": "",
        })
        .to_string())
    }
}

/// Pull the `SCOPE_JSON:` parameter back out of a rendered prompt.
pub fn scope_from_prompt(prompt: &str) -> Option<CodeScope> {
    let line = prompt
        .lines()
        .find_map(|l| l.strip_prefix("SCOPE_JSON: "))?;
    serde_json::from_str(line).ok()
}

/// Split a scope into a valid partition: by file when it spans several
/// files, otherwise by halving the largest range. A one-line scope comes
/// back as a single identical part.
pub fn split_scope(scope: &CodeScope) -> Vec<CodeScope> {
    let files = scope.files();
    if files.len() > 1 {
        return files
            .into_iter()
            .map(|file| {
                CodeScope::new(
                    scope
                        .ranges
                        .iter()
                        .filter(|r| r.file == file)
                        .cloned()
                        .collect(),
                )
            })
            .collect();
    }
    if scope.ranges.len() == 1 && scope.ranges[0].line_count() > 1 {
        let r = &scope.ranges[0];
        let mid = r.start_line + (r.end_line - r.start_line) / 2;
        let mut left = r.clone();
        left.end_line = mid;
        let mut right = r.clone();
        right.start_line = mid + 1;
        return vec![CodeScope::new(vec![left]), CodeScope::new(vec![right])];
    }
    if scope.ranges.len() > 1 {
        let mid = scope.ranges.len() / 2;
        return vec![
            CodeScope::new(scope.ranges[..mid].to_vec()),
            CodeScope::new(scope.ranges[mid..].to_vec()),
        ];
    }
    vec![scope.clone()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use theme_protocol::ScopeRange;

    fn range(file: &str, start: usize, end: usize) -> ScopeRange {
        ScopeRange {
            file: file.to_string(),
            start_line: start,
            end_line: end,
        }
    }

    #[test]
    fn split_scope_partitions_multi_file_scopes_by_file() {
        let scope = CodeScope::new(vec![range("a.rs", 1, 5), range("b.rs", 2, 4)]);
        let parts = split_scope(&scope);
        assert_eq!(parts.len(), 2);
        let refs: Vec<&CodeScope> = parts.iter().collect();
        assert!(scope.is_partitioned_by(&refs));
    }

    #[test]
    fn split_scope_halves_a_single_range() {
        let scope = CodeScope::new(vec![range("a.rs", 1, 10)]);
        let parts = split_scope(&scope);
        let refs: Vec<&CodeScope> = parts.iter().collect();
        assert!(scope.is_partitioned_by(&refs));
        assert_eq!(parts.len(), 2);
    }
}
