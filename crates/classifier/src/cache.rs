//! Keyed response cache with TTL and byte-budget eviction.
//!
//! Entries are immutable once written: created on the first successful
//! result for a key, dropped when the TTL elapses or when the global byte
//! budget forces oldest-inserted eviction. Safe for concurrent use; the
//! internal mutex is only held around bookkeeping, never across awaits.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use theme_protocol::{CacheConfig, ClassificationKind, ClassificationPayload};

struct CacheEntry {
    payload: ClassificationPayload,
    created_ms: u64,
    ttl: Duration,
    bytes: usize,
    /// Insertion sequence, used to match this entry against the FIFO order
    /// queue (a re-set key leaves a stale slot behind).
    seq: u64,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, CacheEntry>,
    /// Insertion order for FIFO eviction: (seq, key).
    order: VecDeque<(u64, String)>,
    total_bytes: usize,
    next_seq: u64,
}

/// Point-in-time cache statistics; reading mutates nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared classification response cache.
pub struct ResponseCache {
    cfg: CacheConfig,
    inner: Mutex<CacheInner>,
    start: Instant,
    clock_offset_ms: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(CacheInner::default()),
            start: Instant::now(),
            clock_offset_ms: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Configured TTL for a request kind.
    pub fn ttl_for(&self, kind: ClassificationKind) -> Duration {
        match kind {
            ClassificationKind::Expansion => {
                Duration::from_secs(self.cfg.expansion_ttl_secs)
            }
            ClassificationKind::Similarity => {
                Duration::from_secs(self.cfg.similarity_ttl_secs)
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64 + self.clock_offset_ms.load(Ordering::Relaxed)
    }

    /// Advance the cache clock, for TTL tests and operational rehearsal.
    pub fn advance(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> Option<ClassificationPayload> {
        let now = self.now_ms();
        let mut inner = self.inner.lock().expect("cache mutex");
        let expired_now = matches!(inner.map.get(key), Some(e) if expired(e, now));
        let hit = if expired_now {
            // Expired; drop it eagerly so the bytes come back.
            if let Some(entry) = inner.map.remove(key) {
                inner.total_bytes -= entry.bytes;
            }
            None
        } else {
            inner.map.get(key).map(|e| e.payload.clone())
        };
        drop(inner);
        match hit {
            Some(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(payload)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Single-pass batch lookup. Observes cache state at points in time no
    /// earlier than the call itself; no stronger consistency is promised.
    pub fn get_batch(&self, keys: &[&str]) -> Vec<Option<ClassificationPayload>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn set(&self, key: &str, payload: ClassificationPayload, ttl: Duration) {
        let bytes = payload.approx_bytes();
        let now = self.now_ms();
        let mut inner = self.inner.lock().expect("cache mutex");
        if let Some(old) = inner.map.remove(key) {
            inner.total_bytes -= old.bytes;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((seq, key.to_string()));
        inner.total_bytes += bytes;
        inner.map.insert(
            key.to_string(),
            CacheEntry {
                payload,
                created_ms: now,
                ttl,
                bytes,
                seq,
            },
        );
        self.evict_over_budget(&mut inner);
    }

    /// Evict oldest-inserted entries until the byte budget is met.
    fn evict_over_budget(&self, inner: &mut CacheInner) {
        while inner.total_bytes > self.cfg.byte_budget {
            let Some((seq, key)) = inner.order.pop_front() else {
                break;
            };
            let matches = inner.map.get(&key).map(|e| e.seq == seq).unwrap_or(false);
            if matches {
                if let Some(entry) = inner.map.remove(&key) {
                    inner.total_bytes -= entry.bytes;
                    log::debug!("cache evicted {key} ({} bytes)", entry.bytes);
                }
            }
            // A stale order slot (key re-set later) is simply discarded.
        }
    }

    /// Drop entries, optionally only those of one request kind.
    pub fn clear(&self, scope: Option<ClassificationKind>) {
        let mut inner = self.inner.lock().expect("cache mutex");
        match scope {
            None => {
                inner.map.clear();
                inner.order.clear();
                inner.total_bytes = 0;
            }
            Some(kind) => {
                let prefix = format!("{}:", kind.as_str());
                let doomed: Vec<String> = inner
                    .map
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect();
                for key in doomed {
                    if let Some(entry) = inner.map.remove(&key) {
                        inner.total_bytes -= entry.bytes;
                    }
                }
                inner.order.retain(|(_, k)| !k.starts_with(&prefix));
            }
        }
    }

    /// Fill the cache by invoking `producer` for every missing key.
    ///
    /// The producer runs outside the cache lock; a `None` result leaves the
    /// key absent.
    pub async fn warm<F, Fut>(&self, keys: &[(String, ClassificationKind)], mut producer: F)
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Option<ClassificationPayload>>,
    {
        for (key, kind) in keys {
            if self.get(key).is_some() {
                continue;
            }
            if let Some(payload) = producer(key.clone()).await {
                self.set(key, payload, self.ttl_for(*kind));
            }
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.lock().expect("cache mutex");
        CacheSnapshot {
            entries: inner.map.len(),
            total_bytes: inner.total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn expired(entry: &CacheEntry, now_ms: u64) -> bool {
    now_ms.saturating_sub(entry.created_ms) >= entry.ttl.as_millis() as u64
}
