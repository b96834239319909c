//! Per-run expansion bookkeeping.
//!
//! One ledger instance is shared by every decomposition branch of a run.
//! It remembers how often each node id was expanded and which nodes were
//! already judged atomic, and is reset only by explicit caller action at
//! the start of a new analysis run.

use std::collections::HashMap;
use std::sync::Mutex;

use theme_protocol::ThemeId;

#[derive(Default)]
struct LedgerEntry {
    attempts: u32,
    atomic_reason: Option<String>,
}

/// Point-in-time ledger statistics; reading mutates nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub tracked_nodes: usize,
    pub atomic_nodes: usize,
    pub total_attempts: u64,
}

/// Shared expansion attempt counter and atomic-decision memo.
#[derive(Default)]
pub struct ExpansionLedger {
    inner: Mutex<HashMap<ThemeId, LedgerEntry>>,
}

impl ExpansionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one expansion attempt; returns the total so far for this id.
    pub fn record_attempt(&self, id: ThemeId) -> u32 {
        let mut inner = self.inner.lock().expect("ledger mutex");
        let entry = inner.entry(id).or_default();
        entry.attempts += 1;
        entry.attempts
    }

    pub fn attempts(&self, id: ThemeId) -> u32 {
        self.inner
            .lock()
            .expect("ledger mutex")
            .get(&id)
            .map(|e| e.attempts)
            .unwrap_or(0)
    }

    /// Memoize an atomic decision so re-queued nodes skip the model.
    pub fn memoize_atomic(&self, id: ThemeId, reason: &str) {
        let mut inner = self.inner.lock().expect("ledger mutex");
        inner.entry(id).or_default().atomic_reason = Some(reason.to_string());
    }

    pub fn atomic_reason(&self, id: ThemeId) -> Option<String> {
        self.inner
            .lock()
            .expect("ledger mutex")
            .get(&id)
            .and_then(|e| e.atomic_reason.clone())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("ledger mutex");
        BreakerSnapshot {
            tracked_nodes: inner.len(),
            atomic_nodes: inner.values().filter(|e| e.atomic_reason.is_some()).count(),
            total_attempts: inner.values().map(|e| u64::from(e.attempts)).sum(),
        }
    }

    /// Explicit reset at the start of a new analysis run.
    pub fn reset(&self) {
        self.inner.lock().expect("ledger mutex").clear();
    }
}
