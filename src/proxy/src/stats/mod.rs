//! Lock-free data-path counters. Writers touch relaxed atomics only; the
//! snapshot reader recomputes derived values on demand. Snapshots may be
//! microscopically inconsistent under concurrent updates (a counter pair
//! can straddle a write) but never torn.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Seconds of query history the QPS figure averages over.
const QPS_WINDOW_SECS: usize = 10;

struct QpsSlot {
    stamp: AtomicU64,
    count: AtomicU64,
}

/// Ring of one-second buckets. Each record CASes the bucket's stamp to the
/// current second before counting into it, so stale buckets are reset
/// without a lock; losing the CAS race just means someone else already
/// reset it.
struct QpsWindow {
    slots: Vec<QpsSlot>,
}

impl QpsWindow {
    fn new() -> Self {
        QpsWindow {
            slots: (0..QPS_WINDOW_SECS)
                .map(|_| QpsSlot {
                    stamp: AtomicU64::new(0),
                    count: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    fn record(&self, now_sec: u64) {
        let slot = &self.slots[(now_sec as usize) % QPS_WINDOW_SECS];
        let stamp = slot.stamp.load(Ordering::Relaxed);
        if stamp != now_sec
            && slot
                .stamp
                .compare_exchange(stamp, now_sec, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            slot.count.store(0, Ordering::Relaxed);
        }
        slot.count.fetch_add(1, Ordering::Relaxed);
    }

    fn rate(&self, now_sec: u64) -> f64 {
        let mut total = 0u64;
        for slot in &self.slots {
            let stamp = slot.stamp.load(Ordering::Relaxed);
            if now_sec.saturating_sub(stamp) < QPS_WINDOW_SECS as u64 {
                total += slot.count.load(Ordering::Relaxed);
            }
        }
        total as f64 / QPS_WINDOW_SECS as f64
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_sessions: u64,
    pub total_queries: u64,
    pub blocked_queries: u64,
    pub qps: f64,
    pub block_rate: f64,
    /// Wall clock at capture, epoch milliseconds on the wire.
    pub captured_at_ms: i64,
}

pub struct StatsCollector {
    total_connections: AtomicU64,
    active_sessions: AtomicU64,
    total_queries: AtomicU64,
    blocked_queries: AtomicU64,
    qps: QpsWindow,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector {
            total_connections: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            blocked_queries: AtomicU64::new(0),
            qps: QpsWindow::new(),
        }
    }

    pub fn on_connection_open(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// CAS loop so a double-close can never underflow the gauge.
    pub fn on_connection_close(&self) {
        let mut current = self.active_sessions.load(Ordering::Relaxed);
        while current > 0 {
            match self.active_sessions.compare_exchange(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn on_query(&self, blocked: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.blocked_queries.fetch_add(1, Ordering::Relaxed);
        }
        self.qps.record(Self::now_sec());
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_queries = self.total_queries.load(Ordering::Relaxed);
        let blocked_queries = self.blocked_queries.load(Ordering::Relaxed);
        let block_rate = if total_queries == 0 {
            0.0
        } else {
            blocked_queries as f64 / total_queries as f64
        };
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_queries,
            blocked_queries,
            qps: self.qps.rate(Self::now_sec()),
            block_rate,
            captured_at_ms: Utc::now().timestamp_millis(),
        }
    }

    fn now_sec() -> u64 {
        Utc::now().timestamp().max(0) as u64
    }
}
