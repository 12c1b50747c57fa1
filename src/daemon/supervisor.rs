//! Lifecycle owner for the connection and every background task.
//!
//! All tasks share one cancellation token. A task that returns an error or
//! panics trips the token; so does an explicit [`ShutdownHandle::request_shutdown`].
//! Teardown cancels the token and joins every task within the drain timeout,
//! aborting whatever is still running after that.

use crate::channels::{Connection, Event};
use crate::health::HealthRegistry;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

pub const CONNECTION_COMPONENT: &str = "connection";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `!quit` from an admin
    AdminQuit,
    /// SIGINT / SIGTERM
    Signal,
    TaskFailed { task: String, error: String },
    ConnectionClosed,
    ConnectionFailed(String),
}

impl ShutdownReason {
    /// Whether the host should bring the runtime back up after a cool-down.
    pub fn should_restart(&self) -> bool {
        !matches!(self, Self::AdminQuit | Self::Signal)
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdminQuit => f.write_str("quit requested by admin"),
            Self::Signal => f.write_str("terminated by signal"),
            Self::TaskFailed { task, error } => write!(f, "task {task} failed: {error}"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::ConnectionFailed(error) => write!(f, "connection failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Exited,
    Failed(String),
    /// Aborted after missing the drain deadline
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
}

struct ShutdownState {
    triggered: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
}

/// Cloneable trigger for the shared cancellation token.
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(ShutdownState {
                triggered: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Trip the shared token. Only the first call has any effect; it
    /// returns `true`, every later call returns `false`.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut recorded = self.state.reason.lock();
            if recorded.is_some() {
                return false;
            }
            *recorded = Some(reason.clone());
            // Raised under the lock so a requested shutdown always has a reason.
            self.state.triggered.store(true, Ordering::SeqCst);
        }

        match reason {
            ShutdownReason::TaskFailed { .. } | ShutdownReason::ConnectionFailed(_) => {
                error!(%reason, "shutdown requested");
            }
            _ => info!(%reason, "shutdown requested"),
        }
        self.token.cancel();
        true
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }

    /// Reason recorded by the first request, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.state.reason.lock().clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Supervisor {
    shutdown: ShutdownHandle,
    health: HealthRegistry,
    tasks: JoinSet<TaskOutcome>,
    names: HashMap<Id, String>,
    connection: Option<JoinHandle<Result<()>>>,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(health: HealthRegistry, drain_timeout: Duration) -> Self {
        Self {
            shutdown: ShutdownHandle::new(),
            health,
            tasks: JoinSet::new(),
            names: HashMap::new(),
            connection: None,
            drain_timeout,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.token().clone()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run `task` under supervision. An error or panic requests shutdown;
    /// a normal return is only logged.
    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let health = self.health.clone();
        let task_name = name.to_string();
        health.mark_component_ok(name);

        let abort = self.tasks.spawn(async move {
            let inner = AbortOnDropHandle::new(tokio::spawn(task));
            let failure = match inner.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(e) if e.is_panic() => Some(panic_message(e)),
                Err(_) => return TaskOutcome::Killed,
            };

            match failure {
                None => {
                    if !shutdown.is_shutdown_requested() {
                        warn!(task = %task_name, "supervised task exited early");
                    }
                    health.mark_component_stopped(&task_name);
                    TaskOutcome::Exited
                }
                Some(error) => {
                    health.mark_component_error(&task_name, &error);
                    shutdown.request_shutdown(ShutdownReason::TaskFailed {
                        task: task_name,
                        error: error.clone(),
                    });
                    TaskOutcome::Failed(error)
                }
            }
        });
        self.names.insert(abort.id(), name.to_string());
    }

    /// Bring up the connection. Inbound events go to `events`; once shutdown
    /// is requested the connection is told to quit with the recorded reason.
    pub fn start(&mut self, connection: Arc<dyn Connection>, events: mpsc::Sender<Event>) {
        info!(connection = connection.name(), "starting connection");
        self.health.mark_component_ok(CONNECTION_COMPONENT);

        let listener = Arc::clone(&connection);
        self.connection = Some(tokio::spawn(async move { listener.listen(events).await }));

        let shutdown = self.shutdown.clone();
        let quit_timeout = self.drain_timeout;
        self.spawn("quit", async move {
            shutdown.cancelled().await;
            let reason = shutdown
                .reason()
                .map_or_else(|| "shutting down".to_string(), |r| r.to_string());
            // The shared token is already cancelled here, so only the clock bounds the quit.
            if tokio::time::timeout(quit_timeout, connection.quit(&reason))
                .await
                .is_err()
            {
                warn!(timeout_secs = quit_timeout.as_secs(), "quit did not complete in time");
            }
            Ok(())
        });
    }

    /// Block until the connection terminates and return its outcome. Its end
    /// always requests shutdown; after an earlier request the connection gets
    /// one drain window to finish before it is aborted.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            self.shutdown.cancelled().await;
            return Ok(());
        };

        let joined = tokio::select! {
            joined = &mut connection => joined,
            () = drain_after(&self.shutdown, self.drain_timeout) => {
                warn!("connection did not close in time; aborting");
                connection.abort();
                connection.await
            }
        };

        let outcome = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(anyhow::anyhow!("connection task panicked: {}", panic_message(e))),
        };

        match outcome {
            Ok(()) => {
                self.health.mark_component_stopped(CONNECTION_COMPONENT);
                self.shutdown.request_shutdown(ShutdownReason::ConnectionClosed);
            }
            Err(ref e) => {
                self.health
                    .mark_component_error(CONNECTION_COMPONENT, format!("{e:#}"));
                self.shutdown
                    .request_shutdown(ShutdownReason::ConnectionFailed(format!("{e:#}")));
            }
        }
        outcome
    }

    /// Cancel everything and join each task within the drain timeout.
    pub async fn shutdown(mut self) -> Vec<TaskReport> {
        self.shutdown.token().cancel();
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }

        let deadline = Instant::now() + self.drain_timeout;
        let mut reports = Vec::with_capacity(self.tasks.len());

        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => reports.push(self.report(joined)),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.tasks.len(),
                        "tasks did not drain in time; aborting"
                    );
                    self.tasks.abort_all();
                    while let Some(joined) = self.tasks.join_next_with_id().await {
                        reports.push(self.report(joined));
                    }
                    break;
                }
            }
        }

        for report in &reports {
            match report.outcome {
                TaskOutcome::Exited => debug!(task = %report.name, "task stopped"),
                TaskOutcome::Failed(ref error) => {
                    warn!(task = %report.name, %error, "task failed");
                }
                TaskOutcome::Killed => {
                    self.health
                        .mark_component_error(&report.name, "killed after drain timeout");
                    warn!(task = %report.name, "task killed");
                }
            }
        }
        reports
    }

    fn report(&mut self, joined: Result<(Id, TaskOutcome), JoinError>) -> TaskReport {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (e.id(), TaskOutcome::Killed),
        };
        TaskReport {
            name: self.names.remove(&id).unwrap_or_else(|| format!("task-{id}")),
            outcome,
        }
    }
}

async fn drain_after(shutdown: &ShutdownHandle, timeout: Duration) {
    shutdown.cancelled().await;
    tokio::time::sleep(timeout).await;
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .map_or_else(|| "panicked".to_string(), |msg| format!("panicked: {msg}")),
        Err(e) => e.to_string(),
    }
}
