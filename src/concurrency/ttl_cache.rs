//! TTL cache over a map living in [`SharedState`].
//!
//! Reads never check staleness; eviction happens only in the periodic sweep,
//! which applies one of two policies:
//! - [`SweepPolicy::Selective`] drops entries older than the TTL
//! - [`SweepPolicy::FullFlush`] drops every entry on every tick
//!
//! Misses are not deduplicated. Concurrent misses on the same key each run
//! their own fetch and the last one to finish wins.

use crate::channels::Scope;
use crate::state::{SharedHandle, SharedState};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPolicy {
    Selective,
    FullFlush,
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created: Instant,
}

/// Plain key → entry map; callers hold the shared lock.
#[derive(Debug)]
pub struct CacheMap<V> {
    entries: HashMap<String, CacheEntry<V>>,
}

impl<V> Default for CacheMap<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V: Clone> CacheMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V, now: Instant) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                created: now,
            },
        );
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `policy` and return how many entries were evicted.
    pub fn sweep(&mut self, policy: SweepPolicy, ttl: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        match policy {
            SweepPolicy::FullFlush => self.entries.clear(),
            SweepPolicy::Selective => self
                .entries
                .retain(|_, entry| now.saturating_duration_since(entry.created) <= ttl),
        }
        before - self.entries.len()
    }
}

/// Selects one cache map out of the shared state.
pub type CacheSlot<V> = fn(&mut SharedState) -> &mut CacheMap<V>;

pub struct TtlCache<V> {
    name: &'static str,
    state: SharedHandle,
    slot: CacheSlot<V>,
    policy: SweepPolicy,
    ttl: Duration,
    interval: Duration,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: SharedHandle::clone(&self.state),
            slot: self.slot,
            policy: self.policy,
            ttl: self.ttl,
            interval: self.interval,
        }
    }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    pub fn new(
        name: &'static str,
        state: SharedHandle,
        slot: CacheSlot<V>,
        policy: SweepPolicy,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            name,
            state,
            slot,
            policy,
            ttl,
            interval,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> SweepPolicy {
        self.policy
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        (self.slot)(&mut state).get(key)
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut state = self.state.lock();
        (self.slot)(&mut state).insert(key, value, Instant::now());
    }

    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        (self.slot)(&mut state).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value if present, otherwise run `fetch` under `scope` with the
    /// lock released and store its result. Failures are returned and not cached.
    pub async fn get_or_fetch<F, Fut>(&self, scope: &Scope, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            trace!(cache = self.name, key, "cache hit");
            return Ok(value);
        }

        trace!(cache = self.name, key, "cache miss");
        let value = scope.run(fetch()).await??;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        (self.slot)(&mut state).sweep(self.policy, self.ttl, now)
    }

    /// Sweep on every interval tick until `shutdown` is cancelled.
    pub async fn run_sweeper(self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        debug!(cache = self.name, evicted, "cache swept");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ScopeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prices(state: &mut SharedState) -> &mut CacheMap<String> {
        &mut state.prices
    }

    fn scope() -> Scope {
        Scope::new(&CancellationToken::new(), Duration::from_secs(10))
    }

    fn cache(policy: SweepPolicy) -> TtlCache<String> {
        TtlCache::new(
            "prices",
            SharedState::shared(),
            prices,
            policy,
            Duration::from_secs(600),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn selective_sweep_keeps_young_and_drops_old_entries() {
        let start = Instant::now();
        let mut map = CacheMap::default();
        map.insert("old", 1, start);
        map.insert("young", 2, start + Duration::from_secs(300));

        let evicted = map.sweep(
            SweepPolicy::Selective,
            Duration::from_secs(600),
            start + Duration::from_secs(601),
        );

        assert_eq!(evicted, 1);
        assert!(!map.contains_key("old"));
        assert_eq!(map.get("young"), Some(2));
    }

    #[test]
    fn selective_sweep_keeps_entry_exactly_at_ttl() {
        let start = Instant::now();
        let mut map = CacheMap::default();
        map.insert("edge", 1, start);
        map.sweep(
            SweepPolicy::Selective,
            Duration::from_secs(600),
            start + Duration::from_secs(600),
        );
        assert!(map.contains_key("edge"));
    }

    #[test]
    fn full_flush_drops_fresh_entries() {
        let now = Instant::now();
        let mut map = CacheMap::default();
        map.insert("btc", "1.00".to_string(), now);
        map.insert("eth", "2.00".to_string(), now);

        assert_eq!(map.sweep(SweepPolicy::FullFlush, Duration::from_secs(600), now), 2);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn hit_skips_fetch() {
        let cache = cache(SweepPolicy::Selective);
        cache.insert("btc", "100.00".into());
        let calls = AtomicUsize::new(0);

        let value = cache
            .get_or_fetch(&scope(), "btc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "100.00");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn miss_fetches_and_stores() {
        let cache = cache(SweepPolicy::Selective);
        let value = cache
            .get_or_fetch(&scope(), "eth", || async { Ok("42.10".to_string()) })
            .await
            .unwrap();

        assert_eq!(value, "42.10");
        assert_eq!(cache.get("eth").as_deref(), Some("42.10"));
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = cache(SweepPolicy::Selective);
        let result = cache
            .get_or_fetch(&scope(), "xmr", || async { anyhow::bail!("upstream down") })
            .await;

        assert!(result.is_err());
        assert!(cache.get("xmr").is_none());
    }

    #[tokio::test]
    async fn concurrent_misses_each_fetch() {
        let cache = cache(SweepPolicy::Selective);
        let calls = AtomicUsize::new(0);
        let fetch = |value: &'static str| {
            let calls = &calls;
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(value.to_string())
            }
        };

        let scope = scope();
        let (a, b) = tokio::join!(
            cache.get_or_fetch(&scope, "btc", fetch("1")),
            cache.get_or_fetch(&scope, "btc", fetch("2")),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn reads_ignore_staleness_until_swept() {
        let cache = cache(SweepPolicy::Selective);
        cache.insert("btc", "stale".into());
        let later = Instant::now() + Duration::from_secs(3600);

        assert_eq!(cache.get("btc").as_deref(), Some("stale"));
        assert_eq!(cache.sweep_at(later), 1);
        assert!(cache.get("btc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_past_deadline_is_not_cached() {
        let cache = cache(SweepPolicy::Selective);
        let result = cache
            .get_or_fetch(&scope(), "btc", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("late".to_string())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.downcast_ref::<ScopeError>(), Some(&ScopeError::TimedOut));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_flushes_on_tick_and_stops_on_shutdown() {
        let cache = cache(SweepPolicy::FullFlush);
        cache.insert("btc", "1.00".into());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(cache.clone().run_sweeper(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
