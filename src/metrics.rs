use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::task::{Complexity, TaskStatus};

/// Latency samples kept for mean/p95. Old samples roll off; the window is
/// an observability aid, not an audit log.
const LATENCY_WINDOW: usize = 1024;

#[derive(Default)]
struct Inner {
    total_queries: u64,
    overloaded_rejections: u64,
    coalesced_attaches: u64,
    by_status: BTreeMap<String, u64>,
    by_complexity: BTreeMap<String, u64>,
    latencies_ms: VecDeque<u64>,
    revisions_on_approved: u64,
    approved: u64,
}

/// Read-only snapshot of the engine's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub overloaded_rejections: u64,
    pub coalesced_attaches: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_complexity: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub mean_revisions_per_approved: f64,
    pub active_tasks: usize,
}

/// Engine metrics. All recording paths are cheap: one short mutex hold, no
/// allocation beyond the bounded latency window.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_arrival(&self) {
        let mut inner = self.lock();
        inner.total_queries += 1;
    }

    pub fn record_overloaded(&self) {
        let mut inner = self.lock();
        inner.overloaded_rejections += 1;
    }

    pub fn record_coalesced(&self) {
        let mut inner = self.lock();
        inner.coalesced_attaches += 1;
    }

    pub fn record_cache_hit_delivery(&self) {
        let mut inner = self.lock();
        *inner.by_status.entry("delivered".to_string()).or_insert(0) += 1;
    }

    /// Record a task reaching a terminal status.
    pub fn record_final(
        &self,
        status: TaskStatus,
        complexity: Option<Complexity>,
        latency_ms: u64,
        revisions_used: u32,
    ) {
        let mut inner = self.lock();
        *inner.by_status.entry(status.to_string()).or_insert(0) += 1;
        if let Some(complexity) = complexity {
            *inner
                .by_complexity
                .entry(complexity.to_string())
                .or_insert(0) += 1;
        }
        if inner.latencies_ms.len() == LATENCY_WINDOW {
            inner.latencies_ms.pop_front();
        }
        inner.latencies_ms.push_back(latency_ms);
        if status == TaskStatus::Delivered {
            inner.approved += 1;
            inner.revisions_on_approved += u64::from(revisions_used);
        }
    }

    pub fn snapshot(&self, cache_stats: (u64, u64), active_tasks: usize) -> MetricsSnapshot {
        let inner = self.lock();
        let (cache_hits, cache_misses) = cache_stats;
        let lookups = cache_hits + cache_misses;

        let mut sorted: Vec<u64> = inner.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };
        let p95 = if sorted.is_empty() {
            0
        } else {
            let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
            sorted[idx.min(sorted.len()) - 1]
        };

        MetricsSnapshot {
            total_queries: inner.total_queries,
            overloaded_rejections: inner.overloaded_rejections,
            coalesced_attaches: inner.coalesced_attaches,
            by_status: inner.by_status.clone(),
            by_complexity: inner.by_complexity.clone(),
            cache_hits,
            cache_misses,
            cache_hit_rate: if lookups > 0 {
                cache_hits as f64 / lookups as f64
            } else {
                0.0
            },
            mean_latency_ms: mean,
            p95_latency_ms: p95,
            mean_revisions_per_approved: if inner.approved > 0 {
                inner.revisions_on_approved as f64 / inner.approved as f64
            } else {
                0.0
            },
            active_tasks,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_status_and_complexity() {
        let m = Metrics::new();
        m.record_arrival();
        m.record_arrival();
        m.record_final(TaskStatus::Delivered, Some(Complexity::Simple), 100, 0);
        m.record_final(TaskStatus::Rejected, Some(Complexity::Critical), 300, 2);

        let snap = m.snapshot((0, 0), 0);
        assert_eq!(snap.total_queries, 2);
        assert_eq!(snap.by_status.get("delivered"), Some(&1));
        assert_eq!(snap.by_status.get("rejected"), Some(&1));
        assert_eq!(snap.by_complexity.get("simple"), Some(&1));
        assert_eq!(snap.by_complexity.get("critical"), Some(&1));
    }

    #[test]
    fn latency_stats() {
        let m = Metrics::new();
        for ms in [100u64, 200, 300, 400] {
            m.record_final(TaskStatus::Delivered, Some(Complexity::Simple), ms, 0);
        }
        let snap = m.snapshot((0, 0), 0);
        assert!((snap.mean_latency_ms - 250.0).abs() < f64::EPSILON);
        assert_eq!(snap.p95_latency_ms, 400);
    }

    #[test]
    fn revisions_per_approved() {
        let m = Metrics::new();
        m.record_final(TaskStatus::Delivered, Some(Complexity::Standard), 10, 0);
        m.record_final(TaskStatus::Delivered, Some(Complexity::Complex), 10, 2);
        // Rejected tasks do not count toward the approved mean.
        m.record_final(TaskStatus::Rejected, Some(Complexity::Complex), 10, 2);
        let snap = m.snapshot((0, 0), 0);
        assert!((snap.mean_revisions_per_approved - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cache_hit_rate() {
        let m = Metrics::new();
        let snap = m.snapshot((3, 1), 0);
        assert!((snap.cache_hit_rate - 0.75).abs() < f64::EPSILON);
        let snap = m.snapshot((0, 0), 0);
        assert!((snap.cache_hit_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_window_is_bounded() {
        let m = Metrics::new();
        for i in 0..(LATENCY_WINDOW as u64 + 100) {
            m.record_final(TaskStatus::Delivered, None, i, 0);
        }
        let snap = m.snapshot((0, 0), 0);
        // Oldest samples rolled off: minimum retained latency is 100.
        assert!(snap.mean_latency_ms >= 100.0);
    }
}
