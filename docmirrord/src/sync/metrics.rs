use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counters for a single run. Created by the orchestrator per invocation and shared by reference
/// with the components working on that run; never reused across runs.
#[derive(Debug, Default)]
pub struct RunMetrics {
    api_calls: AtomicU64,
    api_calls_saved: AtomicU64,
    smart_skips: AtomicU64,
    batch_operations: AtomicU64,
    concurrent_operations: AtomicU64,
    memory_peak: AtomicU64,
    processing_time_ms: AtomicU64,
    rate_limited: AtomicU64,
    retries: AtomicU64,
    candidates: AtomicU64,
    reclamations: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub api_calls: u64,
    pub api_calls_saved: u64,
    pub smart_skips: u64,
    pub batch_operations: u64,
    pub concurrent_operations: u64,
    pub memory_peak: u64,
    pub processing_time_ms: u64,
    pub rate_limited: u64,
    pub retries: u64,
    pub candidates: u64,
    pub reclamations: u64,
    pub optimization_efficiency: f64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls_saved(&self, count: u64) {
        self.api_calls_saved.fetch_add(count, Ordering::Relaxed);
    }

    /// Records `total` items examined for change, of which `skipped` were left alone.
    pub fn candidates(&self, total: u64, skipped: u64) {
        self.candidates.fetch_add(total, Ordering::Relaxed);
        self.smart_skips.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn batch_operation(&self) {
        self.batch_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn concurrent_operations(&self, count: u64) {
        self.concurrent_operations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn observe_memory(&self, bytes: u64) {
        self.memory_peak.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reclamation(&self) {
        self.reclamations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_processing_time(&self, elapsed: Duration) {
        let ms = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
        self.processing_time_ms.store(ms, Ordering::Relaxed);
    }

    /// Percentage of candidate items skipped. A run with no candidates had nothing to do.
    pub fn efficiency(&self) -> f64 {
        efficiency(
            self.smart_skips.load(Ordering::Relaxed),
            self.candidates.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            api_calls_saved: self.api_calls_saved.load(Ordering::Relaxed),
            smart_skips: self.smart_skips.load(Ordering::Relaxed),
            batch_operations: self.batch_operations.load(Ordering::Relaxed),
            concurrent_operations: self.concurrent_operations.load(Ordering::Relaxed),
            memory_peak: self.memory_peak.load(Ordering::Relaxed),
            processing_time_ms: self.processing_time_ms.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            reclamations: self.reclamations.load(Ordering::Relaxed),
            optimization_efficiency: self.efficiency(),
        }
    }
}

pub fn efficiency(skipped: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = skipped as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efficiency_is_skipped_over_candidates() {
        let metrics = RunMetrics::new();
        metrics.candidates(4, 3);
        assert_eq!(metrics.efficiency(), 75.0);
        assert_eq!(efficiency(0, 0), 100.0);
        assert_eq!(efficiency(1, 3), 33.33);
    }

    #[test]
    fn memory_peak_keeps_maximum() {
        let metrics = RunMetrics::new();
        metrics.observe_memory(10);
        metrics.observe_memory(40);
        metrics.observe_memory(20);
        assert_eq!(metrics.snapshot().memory_peak, 40);
    }
}
