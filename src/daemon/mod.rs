pub mod supervisor;

pub use supervisor::{ShutdownHandle, ShutdownReason, Supervisor, TaskOutcome, TaskReport};

use crate::backup::BackupManager;
use crate::channels::{self, Connection, Scope};
use crate::commands::{BotContext, Endpoints, command_table};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::health::HealthRegistry;
use crate::poller::{HttpFeed, NewsPoller};
use crate::state::SharedState;
use crate::store::Store;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inbound events buffered between the connection and the dispatcher.
const EVENT_QUEUE: usize = 256;

/// How a runtime ended and how each of its tasks finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: ShutdownReason,
    pub tasks: Vec<TaskReport>,
}

impl RunSummary {
    /// Tasks aborted because they missed the drain deadline.
    pub fn killed(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|report| report.outcome == TaskOutcome::Killed)
            .map(|report| report.name.as_str())
            .collect()
    }
}

/// Run one runtime over the configured connection until it stops, and report why.
pub async fn run(config: Config) -> Result<ShutdownReason> {
    let connection = channels::connect(&config);
    let summary = run_with(config, connection, Endpoints::default()).await?;
    Ok(summary.reason)
}

/// Run one runtime over `connection`.
///
/// Setup failures (store, HTTP client, news pattern) are fatal and happen
/// before any task starts. After that everything is a supervised task; the
/// first task failure, a signal, an admin quit or the connection closing ends
/// the runtime.
pub async fn run_with(
    config: Config,
    connection: Arc<dyn Connection>,
    endpoints: Endpoints,
) -> Result<RunSummary> {
    let config = Arc::new(config);
    let health = HealthRegistry::new();
    health.mark_component_ok("daemon");

    let store = Store::open(&config.dbname)
        .with_context(|| format!("cannot open database {}", config.dbname.display()))?;
    let state = SharedState::shared();
    let mut supervisor = Supervisor::new(health.clone(), config.timeout());
    let token = supervisor.token();

    let ctx = Arc::new(
        BotContext::new(
            Arc::clone(&config),
            Arc::clone(&connection),
            store.clone(),
            Arc::clone(&state),
            supervisor.handle(),
            health.clone(),
        )?
        .with_endpoints(endpoints),
    );

    let poller = match (config.news_url.as_deref(), config.news_channel()) {
        (Some(url), Some(destination)) => {
            let feed = HttpFeed::new(ctx.fetcher.clone(), url, config.news_pattern.as_deref())?;
            Some(NewsPoller::new(
                Arc::new(feed),
                Arc::clone(&connection),
                Arc::clone(&state),
                destination,
                config.news_prefix(),
                config.news_minute(),
                config.timeout(),
            ))
        }
        (Some(_), None) => {
            tracing::warn!("news url set but no destination; poller disabled");
            None
        }
        (None, _) => None,
    };

    let backup = BackupManager::new(
        Arc::new(store),
        config.snapshot_path(),
        config.backup_interval(),
        config.timeout(),
    );
    supervisor.spawn("backup", backup.run(token.clone()));
    if let Some(poller) = poller {
        supervisor.spawn("poller", poller.run(token.clone()));
    }

    supervisor.spawn("weather-sweeper", ctx.weather.clone().run_sweeper(token.clone()));
    supervisor.spawn("price-sweeper", ctx.prices.clone().run_sweeper(token.clone()));
    supervisor.spawn("signals", watch_signals(supervisor.handle()));

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let dispatcher = Dispatcher::new(Arc::clone(&ctx), command_table());
    supervisor.spawn("dispatch", dispatcher.run(rx, token.clone()));

    supervisor.start(Arc::clone(&connection), tx);
    join_channels(&ctx, &token).await;

    if let Err(e) = supervisor.wait().await {
        tracing::error!(error = %format!("{e:#}"), "connection failed");
    }

    let handle = supervisor.handle();
    let tasks = supervisor.shutdown().await;

    let reason = handle.reason().unwrap_or(ShutdownReason::ConnectionClosed);
    tracing::debug!(health = %health.snapshot_json(), "final health");
    tracing::info!(%reason, tasks = tasks.len(), "runtime stopped");
    Ok(RunSummary { reason, tasks })
}

/// Join every configured destination, register it and prime its cooldown.
/// A failed join is logged and skipped.
async fn join_channels(ctx: &BotContext, shutdown: &CancellationToken) {
    for name in &ctx.config.channels {
        let scope = Scope::new(shutdown, ctx.config.timeout());
        let joined = match scope.run(ctx.connection.join(&scope, name)).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        match joined {
            Ok(handle) => {
                ctx.state.lock().destinations.insert(handle);
                ctx.limiter.prime(name);
                tracing::info!(destination = %name, "joined");
            }
            Err(e) => {
                tracing::warn!(destination = %name, error = %format!("{e:#}"), "join failed");
            }
        }
    }
}

/// Turn Ctrl-C or SIGTERM into a shutdown request.
async fn watch_signals(shutdown: ShutdownHandle) -> Result<()> {
    tokio::select! {
        () = shutdown.cancelled() => return Ok(()),
        received = wait_for_signal() => received?,
    }
    shutdown.request_shutdown(ShutdownReason::Signal);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("cannot listen for Ctrl-C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryConnection;
    use crate::commands::testing::config;
    use std::time::Duration;
    use tempfile::TempDir;

    fn runtime_config(tmp: &TempDir) -> Config {
        Config {
            dbname: tmp.path().join("bot.db"),
            timeout_secs: Some(2),
            ..config()
        }
    }

    #[tokio::test]
    async fn admin_quit_stops_runtime_with_reason() {
        let tmp = TempDir::new().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        let runtime = tokio::spawn(run_with(
            runtime_config(&tmp),
            conn.clone(),
            Endpoints::default(),
        ));

        while conn.joined().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(conn.inject(conn.public("#mania", "root!root@admin.host", "!quit")));

        let summary = tokio::time::timeout(Duration::from_secs(10), runtime)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reason = summary.reason;
        assert_eq!(reason, ShutdownReason::AdminQuit);
        assert!(!reason.should_restart());
        assert_eq!(conn.quit_reason().as_deref(), Some("quit requested by admin"));
    }

    #[tokio::test]
    async fn connection_loss_ends_runtime_for_restart() {
        let tmp = TempDir::new().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        let runtime = tokio::spawn(run_with(
            runtime_config(&tmp),
            conn.clone(),
            Endpoints::default(),
        ));

        while conn.joined().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        conn.hang_up();

        let summary = tokio::time::timeout(Duration::from_secs(10), runtime)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reason = summary.reason;
        assert_eq!(reason, ShutdownReason::ConnectionClosed);
        assert!(reason.should_restart());
    }

    #[tokio::test]
    async fn unopenable_database_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let cfg = Config {
            dbname: blocker.join("bot.db"),
            ..config()
        };

        let result = run_with(cfg, Arc::new(MemoryConnection::new()), Endpoints::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn bad_news_pattern_fails_before_any_task_starts() {
        let tmp = TempDir::new().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        let cfg = Config {
            news_url: Some("http://127.0.0.1:9/s/news".into()),
            news_pattern: Some("(unclosed".into()),
            ..runtime_config(&tmp)
        };

        let err = run_with(cfg, conn.clone(), Endpoints::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid news pattern"));
        assert!(conn.joined().is_empty());
        assert!(!tmp.path().join("bot.db.backup").exists());
    }
}
