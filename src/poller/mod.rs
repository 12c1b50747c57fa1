//! Hourly news poller.
//!
//! Fires at a fixed minute of every hour, fetches the feed, extracts the
//! latest item and announces it to one destination unless it equals the last
//! item announced.

use crate::channels::{Connection, Scope};
use crate::fetch::{HttpFetcher, extract_last_match};
use crate::state::{SharedHandle, lookup_destination};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Timelike;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Matches the text of a post in a public channel preview page.
pub const DEFAULT_NEWS_PATTERN: &str =
    r#"(?s)<div class="tgme_widget_message_text[^"]*"[^>]*>(.*?)</div>"#;

/// Source of the latest feed item.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn latest(&self, scope: &Scope) -> anyhow::Result<String>;
}

pub struct HttpFeed {
    fetcher: HttpFetcher,
    url: String,
    pattern: Regex,
}

impl HttpFeed {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>, pattern: Option<&str>) -> anyhow::Result<Self> {
        let pattern = pattern.unwrap_or(DEFAULT_NEWS_PATTERN);
        Ok(Self {
            fetcher,
            url: url.into(),
            pattern: Regex::new(pattern).with_context(|| format!("invalid news pattern {pattern:?}"))?,
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    async fn latest(&self, scope: &Scope) -> anyhow::Result<String> {
        let page = self.fetcher.get(scope, &self.url, "text/html").await?;
        extract_last_match(&page.body, &self.pattern)
            .ok_or_else(|| anyhow::anyhow!("no item found in {}", self.url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Announced(String),
    Duplicate,
    Failed(String),
    /// The destination is not joined; nothing was sent
    NoDestination,
}

/// Delay until the next `minute` past the hour, at minute granularity.
/// Firing exactly on the current minute waits one minute.
pub fn first_delay(minute: u32, current_minute: u32) -> Duration {
    let delta = i64::from(minute % 60) - i64::from(current_minute % 60);
    let minutes = match delta {
        d if d > 0 => d,
        0 => 1,
        d => 60 + d,
    };
    Duration::from_secs(minutes.unsigned_abs() * 60)
}

pub struct NewsPoller {
    source: Arc<dyn FeedSource>,
    connection: Arc<dyn Connection>,
    state: SharedHandle,
    destination: String,
    prefix: String,
    minute: u32,
    timeout: Duration,
    last: Option<String>,
}

impl NewsPoller {
    pub fn new(
        source: Arc<dyn FeedSource>,
        connection: Arc<dyn Connection>,
        state: SharedHandle,
        destination: impl Into<String>,
        prefix: impl Into<String>,
        minute: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            connection,
            state,
            destination: destination.into(),
            prefix: prefix.into(),
            minute,
            timeout,
            last: None,
        }
    }

    pub fn last_announced(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// One fetch-compare-announce cycle, bounded as a whole by the timeout
    /// and by `shutdown`.
    pub async fn tick(&mut self, shutdown: &CancellationToken) -> TickOutcome {
        let scope = Scope::new(shutdown, self.timeout);
        let item = match scope.run(self.source.latest(&scope)).await {
            Ok(Ok(item)) => item,
            Ok(Err(e)) => return self.failed(format!("{e:#}")),
            Err(e) => return self.failed(e.to_string()),
        };

        if self.last.as_deref() == Some(item.as_str()) {
            debug!(destination = %self.destination, "news unchanged");
            return TickOutcome::Duplicate;
        }

        let Some(handle) = lookup_destination(&self.state, &self.destination) else {
            warn!(destination = %self.destination, "news destination not joined; skipping");
            return TickOutcome::NoDestination;
        };

        let text = format!("{} {item}", self.prefix);
        match scope.run(self.connection.announce(&handle, &text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.failed(format!("{e:#}")),
            Err(e) => return self.failed(e.to_string()),
        }
        info!(destination = %self.destination, "news announced");
        self.last = Some(item.clone());
        TickOutcome::Announced(item)
    }

    fn failed(&self, error: String) -> TickOutcome {
        warn!(destination = %self.destination, %error, "news poll failed");
        TickOutcome::Failed(error)
    }

    /// Tick at the configured minute, then hourly, until `shutdown`.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let first = first_delay(self.minute, chrono::Local::now().minute());
        info!(eta_secs = first.as_secs(), destination = %self.destination, "news poller armed");

        let mut ticker = tokio::time::interval_at(Instant::now() + first, POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.tick(&shutdown).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{DestinationHandle, MemoryConnection};
    use crate::state::SharedState;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted results, then keeps returning the last one.
    struct ScriptedFeed {
        script: Mutex<VecDeque<Result<String, String>>>,
    }

    impl ScriptedFeed {
        fn new(items: &[Result<&str, &str>]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    items
                        .iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn latest(&self, _scope: &Scope) -> anyhow::Result<String> {
            let mut script = self.script.lock();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            match next {
                Some(Ok(item)) => Ok(item),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Err(anyhow::anyhow!("empty script")),
            }
        }
    }

    /// Connection whose `announce` never completes.
    struct StalledConnection;

    #[async_trait]
    impl Connection for StalledConnection {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn listen(&self, _tx: tokio::sync::mpsc::Sender<crate::channels::Event>) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn reply(
            &self,
            _scope: &Scope,
            _event: &crate::channels::Event,
            _lines: &[String],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn announce(&self, _destination: &DestinationHandle, _text: &str) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn join(&self, _scope: &Scope, name: &str) -> anyhow::Result<DestinationHandle> {
            Ok(DestinationHandle::new(name))
        }

        async fn quit(&self, _reason: &str) {}
    }

    fn stalled_poller() -> NewsPoller {
        let state = SharedState::shared();
        state
            .lock()
            .destinations
            .insert(DestinationHandle::new("#mania"));
        NewsPoller::new(
            ScriptedFeed::new(&[Ok("a")]),
            Arc::new(StalledConnection),
            state,
            "#mania",
            "news:",
            21,
            Duration::from_secs(10),
        )
    }

    fn poller(feed: Arc<ScriptedFeed>, joined: bool) -> (NewsPoller, Arc<MemoryConnection>) {
        let conn = Arc::new(MemoryConnection::new());
        let state = SharedState::shared();
        if joined {
            state
                .lock()
                .destinations
                .insert(DestinationHandle::new("#mania"));
        }
        let poller = NewsPoller::new(
            feed,
            conn.clone(),
            state,
            "#mania",
            "news:",
            21,
            Duration::from_secs(10),
        );
        (poller, conn)
    }

    #[test]
    fn first_delay_aligns_to_minute() {
        assert_eq!(first_delay(21, 0), Duration::from_secs(21 * 60));
        assert_eq!(first_delay(21, 20), Duration::from_secs(60));
        assert_eq!(first_delay(21, 21), Duration::from_secs(60));
        assert_eq!(first_delay(21, 22), Duration::from_secs(59 * 60));
        assert_eq!(first_delay(0, 59), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn same_item_twice_announces_once() {
        let (mut poller, conn) = poller(ScriptedFeed::new(&[Ok("a"), Ok("a")]), true);
        let token = CancellationToken::new();

        assert_eq!(poller.tick(&token).await, TickOutcome::Announced("a".into()));
        assert_eq!(poller.tick(&token).await, TickOutcome::Duplicate);
        assert_eq!(
            conn.announcements(),
            vec![("#mania".to_string(), "news: a".to_string())]
        );
    }

    #[tokio::test]
    async fn different_items_announce_twice() {
        let (mut poller, conn) = poller(ScriptedFeed::new(&[Ok("a"), Ok("b")]), true);
        let token = CancellationToken::new();

        poller.tick(&token).await;
        poller.tick(&token).await;
        assert_eq!(conn.announcements().len(), 2);
        assert_eq!(poller.last_announced(), Some("b"));
    }

    #[tokio::test]
    async fn failure_keeps_last_value() {
        let feed = ScriptedFeed::new(&[Ok("a"), Err("timeout"), Ok("a")]);
        let (mut poller, conn) = poller(feed, true);
        let token = CancellationToken::new();

        poller.tick(&token).await;
        assert!(matches!(poller.tick(&token).await, TickOutcome::Failed(_)));
        assert_eq!(poller.last_announced(), Some("a"));
        assert_eq!(poller.tick(&token).await, TickOutcome::Duplicate);
        assert_eq!(conn.announcements().len(), 1);
    }

    #[tokio::test]
    async fn missing_destination_skips_without_recording() {
        let (mut poller, conn) = poller(ScriptedFeed::new(&[Ok("a")]), false);
        let token = CancellationToken::new();

        assert_eq!(poller.tick(&token).await, TickOutcome::NoDestination);
        assert_eq!(poller.last_announced(), None);
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn announce_failure_does_not_record_item() {
        let (mut poller, conn) = poller(ScriptedFeed::new(&[Ok("a")]), true);
        conn.hang_up();

        let outcome = poller.tick(&CancellationToken::new()).await;
        assert!(matches!(outcome, TickOutcome::Failed(_)));
        assert_eq!(poller.last_announced(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_announce_times_out() {
        let mut poller = stalled_poller();
        let started = Instant::now();

        let outcome = poller.tick(&CancellationToken::new()).await;

        assert_eq!(outcome, TickOutcome::Failed("operation timed out".into()));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
        assert_eq!(poller.last_announced(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_announce_yields_to_shutdown() {
        let mut poller = stalled_poller();
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };
        let started = Instant::now();

        let outcome = poller.tick(&token).await;

        assert_eq!(outcome, TickOutcome::Failed("operation cancelled".into()));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(poller.last_announced(), None);
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let (poller, _conn) = poller(ScriptedFeed::new(&[Ok("a")]), true);
        let token = CancellationToken::new();
        let task = tokio::spawn(poller.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        task.await.unwrap().unwrap();
    }
}
