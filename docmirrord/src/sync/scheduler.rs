use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::metrics::RunMetrics;
use crate::config::SyncConfig;

const LARGE_ITEM_BYTES: u64 = 50 * 1024 * 1024;
const SMALL_ITEM_BYTES: u64 = 1024 * 1024;
const MANY_ATTRIBUTES: usize = 10;
const RECENT_WINDOW: time::Duration = time::Duration::days(1);
const RECLAIM_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub const ORDER: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];
}

/// What the scheduler knows about an item before any enrichment call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierHints {
    pub size: Option<u64>,
    pub attribute_count: usize,
    pub modified: Option<OffsetDateTime>,
}

/// Large or attribute-heavy items go last; small or freshly modified ones go first.
pub fn tier_for(hints: &TierHints, now: OffsetDateTime) -> Tier {
    if hints.size.is_some_and(|size| size > LARGE_ITEM_BYTES)
        || hints.attribute_count > MANY_ATTRIBUTES
    {
        return Tier::Low;
    }
    let recent = hints
        .modified
        .is_some_and(|modified| now - modified < RECENT_WINDOW);
    let small = hints.size.is_some_and(|size| size <= SMALL_ITEM_BYTES);
    if recent || small {
        Tier::High
    } else {
        Tier::Medium
    }
}

#[derive(Debug)]
pub struct TierBuckets<T> {
    pub high: Vec<T>,
    pub medium: Vec<T>,
    pub low: Vec<T>,
}

impl<T> Default for TierBuckets<T> {
    fn default() -> Self {
        Self {
            high: Vec::new(),
            medium: Vec::new(),
            low: Vec::new(),
        }
    }
}

impl<T> TierBuckets<T> {
    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&mut self, tier: Tier) -> Vec<T> {
        match tier {
            Tier::High => std::mem::take(&mut self.high),
            Tier::Medium => std::mem::take(&mut self.medium),
            Tier::Low => std::mem::take(&mut self.low),
        }
    }
}

/// Source of the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the platform does not expose it.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

pub struct Scheduler {
    width: usize,
    memory_threshold: u64,
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<RunMetrics>,
}

impl Scheduler {
    pub fn new(config: &SyncConfig, probe: Arc<dyn MemoryProbe>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            width: config.max_concurrency_per_tier.max(1),
            memory_threshold: config.memory_threshold_bytes(),
            probe,
            metrics,
        }
    }

    pub fn cap(&self, tier: Tier) -> usize {
        match tier {
            Tier::High => self.width,
            Tier::Medium => (self.width / 2).max(1),
            Tier::Low => (self.width / 4).max(1),
        }
    }

    pub fn partition<T>(
        &self,
        items: Vec<T>,
        now: OffsetDateTime,
        hints: impl Fn(&T) -> TierHints,
    ) -> TierBuckets<T> {
        let mut buckets = TierBuckets::default();
        for item in items {
            match tier_for(&hints(&item), now) {
                Tier::High => buckets.high.push(item),
                Tier::Medium => buckets.medium.push(item),
                Tier::Low => buckets.low.push(item),
            }
        }
        buckets
    }

    /// Runs the tiers one after another, each under its own concurrency cap, and checks memory
    /// between tiers. Results come back in completion order.
    pub async fn run_tiers<T, R, F, Fut>(&self, mut buckets: TierBuckets<T>, mut work: F) -> Vec<R>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = R>,
    {
        if buckets.is_empty() {
            return Vec::new();
        }
        let mut results = Vec::with_capacity(buckets.len());
        for tier in Tier::ORDER {
            let items = buckets.take(tier);
            if items.is_empty() {
                continue;
            }
            let cap = self.cap(tier);
            debug!(?tier, items = items.len(), cap, "running tier");
            self.metrics
                .concurrent_operations(cap.min(items.len()) as u64);
            let done: Vec<R> = stream::iter(items)
                .map(&mut work)
                .buffer_unordered(cap)
                .collect()
                .await;
            results.extend(done);
            if self.memory_exceeded() {
                self.reclaim(&mut results).await;
            }
        }
        results
    }

    fn memory_exceeded(&self) -> bool {
        let Some(resident) = self.probe.resident_bytes() else {
            return false;
        };
        self.metrics.observe_memory(resident);
        resident > self.memory_threshold
    }

    async fn reclaim<R>(&self, results: &mut Vec<R>) {
        info!(
            threshold_bytes = self.memory_threshold,
            "memory above threshold, pausing before next tier"
        );
        results.shrink_to_fit();
        tokio::task::yield_now().await;
        tokio::time::sleep(RECLAIM_PAUSE).await;
        self.metrics.reclamation();
    }
}
