/// Prefetch Module
///
/// Read-ahead cache of bundles keyed by height. A background task keeps the
/// buffer filled up to `last requested height + window` while the importer
/// consumes heights by exact lookup. The buffer lock is only held for map
/// operations, never across a node call.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::models::Bundle;
use crate::rpc::{FetchOutcome, NodeClient};

const LOG_PREFIX: &str = "Prefetch";

/// Buffer shape after a fill pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub len: usize,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
}

/// What a single fill pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillReport {
    pub fetched: usize,
    pub evicted: usize,
    /// The pass stopped on a failed fetch
    pub interrupted: bool,
}

pub struct PrefetchCache {
    buffer: Mutex<BTreeMap<u64, Arc<Bundle>>>,
    last_requested: AtomicU64,
    window: u64,
    retention: u64,
    wake: Notify,
}

impl PrefetchCache {
    pub fn new(window: u64, retention: u64) -> Self {
        Self {
            buffer: Mutex::new(BTreeMap::new()),
            last_requested: AtomicU64::new(0),
            window,
            retention,
            wake: Notify::new(),
        }
    }

    pub fn last_requested_height(&self) -> u64 {
        self.last_requested.load(Ordering::SeqCst)
    }

    /// Raise the high-water mark of requested heights
    pub fn record_request(&self, height: u64) {
        self.last_requested.fetch_max(height, Ordering::SeqCst);
    }

    /// Record `height` as requested and look it up
    pub fn request(&self, height: u64) -> Option<Arc<Bundle>> {
        self.record_request(height);
        self.lookup(height)
    }

    /// Exact-height lookup. Leaves the entry in place, never fetches.
    pub fn lookup(&self, height: u64) -> Option<Arc<Bundle>> {
        self.lock().get(&height).cloned()
    }

    /// Ask the background task to extend the window. Does not wait.
    pub fn trigger(&self, from_height: u64) {
        self.record_request(from_height);
        self.wake.notify_one();
    }

    pub fn stats(&self) -> BufferStats {
        let buffer = self.lock();
        BufferStats {
            len: buffer.len(),
            min_height: buffer.keys().next().copied(),
            max_height: buffer.keys().next_back().copied(),
        }
    }

    /// One fill pass followed by eviction.
    ///
    /// Seeds an empty buffer at `last requested + window`, otherwise fetches
    /// every height after the current maximum up to that target. Stops quietly
    /// on the first failed fetch; the next pass picks up from there.
    pub async fn fill<C: NodeClient + ?Sized>(&self, client: &C) -> FillReport {
        let mut report = FillReport::default();
        let last_requested = self.last_requested_height();

        // Nothing requested yet, so there is no starting point
        if last_requested == 0 {
            return report;
        }
        let target = last_requested.saturating_add(self.window);

        loop {
            let next = match self.lock().keys().next_back().copied() {
                None => target,
                Some(max) if max >= target => break,
                Some(max) => max + 1,
            };

            match client.fetch_bundle(next).await {
                FetchOutcome::Found(bundle) => {
                    self.lock().insert(next, Arc::new(bundle));
                    report.fetched += 1;
                }
                FetchOutcome::RetryLater(e) | FetchOutcome::Failed(e) => {
                    tracing::debug!(component = LOG_PREFIX, "Stopping fill at block {}: {}", next, e);
                    report.interrupted = true;
                    break;
                }
            }
        }

        report.evicted = self.evict();
        if report.fetched > 0 {
            let stats = self.stats();
            tracing::debug!(
                component = LOG_PREFIX,
                "Buffered {} block(s), buffer holds {} ({:?}..={:?})",
                report.fetched,
                stats.len,
                stats.min_height,
                stats.max_height
            );
        }
        report
    }

    /// Keep only the `window + retention` highest heights up to the buffer's maximum
    fn evict(&self) -> usize {
        let mut buffer = self.lock();
        let Some(max) = buffer.keys().next_back().copied() else {
            return 0;
        };
        let Some(horizon) = max.checked_sub(self.window.saturating_add(self.retention)) else {
            return 0;
        };
        let kept = buffer.split_off(&(horizon + 1));
        let evicted = buffer.len();
        *buffer = kept;
        evicted
    }

    /// Background fill loop. Runs a pass whenever triggered, or at least every
    /// `interval` while idle.
    pub async fn run<C: NodeClient + ?Sized>(self: Arc<Self>, client: Arc<C>, interval: Duration) {
        tracing::info!(component = LOG_PREFIX, "Prefetch started (window {}, retention {})", self.window, self.retention);
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            let report = self.fill(client.as_ref()).await;
            if report.interrupted || report.evicted > 0 {
                tracing::trace!(
                    component = LOG_PREFIX,
                    "Fill pass: {} fetched, {} evicted, interrupted: {}",
                    report.fetched,
                    report.evicted,
                    report.interrupted
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Bundle>>> {
        // A poisoned buffer still holds complete bundles
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockNode;

    #[tokio::test]
    async fn test_no_fill_before_first_request() {
        let node = MockNode::with_chain(500);
        let cache = PrefetchCache::new(100, 20);

        let report = cache.fill(&node).await;
        assert_eq!(report, FillReport::default());
        assert_eq!(node.fetch_attempts(), 0);
    }

    #[tokio::test]
    async fn test_first_fill_seeds_at_window_edge() {
        let node = MockNode::with_chain(500);
        let cache = PrefetchCache::new(100, 20);
        cache.record_request(50);

        let report = cache.fill(&node).await;
        assert_eq!(report.fetched, 1);
        assert_eq!(cache.stats(), BufferStats { len: 1, min_height: Some(150), max_height: Some(150) });
    }

    #[tokio::test]
    async fn test_fill_extends_window_and_evicts_behind_retention() {
        let node = MockNode::with_chain(500);
        let cache = PrefetchCache::new(100, 20);
        cache.record_request(50);
        cache.fill(&node).await;

        for last in [60, 120, 200, 260] {
            cache.record_request(last);
            cache.fill(&node).await;
            let stats = cache.stats();
            let max = stats.max_height.unwrap();
            assert_eq!(max, last + 100);
            assert!(stats.min_height.unwrap() > max - 120);
            assert!(stats.min_height.unwrap() >= 130);
        }

        // contiguous, ascending, no duplicates
        let stats = cache.stats();
        let expected_len = (stats.max_height.unwrap() - stats.min_height.unwrap() + 1) as usize;
        assert_eq!(stats.len, expected_len);
        assert_eq!(stats, BufferStats { len: 120, min_height: Some(241), max_height: Some(360) });
    }

    #[tokio::test]
    async fn test_buffer_holds_window_plus_retention_heights() {
        let node = MockNode::with_chain(500);
        let cache = PrefetchCache::new(100, 20);

        for last in 1..=300 {
            cache.record_request(last);
            cache.fill(&node).await;
        }

        assert_eq!(cache.stats(), BufferStats { len: 120, min_height: Some(281), max_height: Some(400) });
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let node = MockNode::with_chain(10);
        let cache = PrefetchCache::new(u64::MAX, u64::MAX);
        cache.record_request(5);

        let report = cache.fill(&node).await;
        assert!(report.interrupted);
        assert_eq!(cache.stats().len, 0);
    }

    #[tokio::test]
    async fn test_fill_stops_on_first_failure() {
        let node = MockNode::with_chain(500);
        let cache = PrefetchCache::new(10, 5);
        cache.record_request(1);
        cache.fill(&node).await;

        node.fail_transactions_at(13);
        cache.record_request(10);
        let report = cache.fill(&node).await;

        assert!(report.interrupted);
        assert_eq!(report.fetched, 1);
        assert_eq!(cache.stats().max_height, Some(12));
        assert!(cache.lookup(13).is_none());

        node.heal_transactions_at(13);
        cache.fill(&node).await;
        assert_eq!(cache.stats().max_height, Some(20));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_swallowed() {
        let node = MockNode::with_chain(500);
        node.set_reachable(false);
        let cache = PrefetchCache::new(100, 20);
        cache.record_request(5);

        let report = cache.fill(&node).await;
        assert!(report.interrupted);
        assert_eq!(cache.stats().len, 0);
        assert_eq!(node.fetch_attempts(), 1);
    }

    #[tokio::test]
    async fn test_fill_does_not_pass_remote_tip() {
        let node = MockNode::with_chain(30);
        let cache = PrefetchCache::new(10, 5);
        cache.record_request(15);
        cache.fill(&node).await;
        cache.record_request(25);

        let report = cache.fill(&node).await;
        assert!(report.interrupted);
        assert_eq!(cache.stats().max_height, Some(30));
    }

    #[tokio::test]
    async fn test_lookup_is_exact_and_non_destructive() {
        let node = MockNode::with_chain(500);
        let cache = PrefetchCache::new(10, 5);
        cache.record_request(1);
        cache.fill(&node).await;

        let attempts = node.fetch_attempts();
        assert_eq!(cache.lookup(11).unwrap().height, 11);
        assert_eq!(cache.lookup(11).unwrap().height, 11);
        assert!(cache.lookup(10).is_none());
        assert_eq!(node.fetch_attempts(), attempts);
    }

    #[test]
    fn test_request_raises_high_water_mark_only() {
        let cache = PrefetchCache::new(10, 5);
        cache.request(40);
        cache.request(30);
        assert_eq!(cache.last_requested_height(), 40);
    }

    #[tokio::test]
    async fn test_background_task_fills_on_trigger() {
        let node = Arc::new(MockNode::with_chain(100));
        let cache = Arc::new(PrefetchCache::new(5, 2));
        let task = tokio::spawn(cache.clone().run(node.clone(), Duration::from_secs(3600)));

        cache.trigger(10);
        for _ in 0..100 {
            if cache.lookup(15).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert!(cache.lookup(15).is_some());
    }
}
