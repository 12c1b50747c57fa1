//! Per-event dispatch.
//!
//! Every accepted event runs its handler as its own task, under its own
//! timeout scope. Handler failures are logged here and go no further.

use crate::channels::{Event, Scope, ScopeError};
use crate::commands::{BotContext, CommandTable};
use crate::concurrency::{Backpressure, BackpressureStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// First whitespace-delimited token of the first line, lower-cased.
pub fn command_token(event: &Event) -> String {
    event
        .first_line()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

pub struct Dispatcher {
    ctx: Arc<BotContext>,
    commands: CommandTable,
    gate: Backpressure,
    tracker: TaskTracker,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(ctx: Arc<BotContext>, commands: CommandTable) -> Self {
        let gate = Backpressure::new(ctx.config.max_in_flight());
        let timeout = ctx.config.timeout();
        Self {
            ctx,
            commands,
            gate,
            tracker: TaskTracker::new(),
            timeout,
        }
    }

    pub fn in_flight(&self) -> BackpressureStats {
        self.gate.stats()
    }

    /// Start a handler for `event`. Waits only for an in-flight slot, never for
    /// the handler. Returns `false` if the event was dropped.
    pub async fn dispatch(&self, event: Event, shutdown: &CancellationToken) -> bool {
        if event.lines.iter().all(|line| line.trim().is_empty()) {
            trace!(id = event.id, "empty event dropped");
            return false;
        }
        if self.ctx.config.is_ignored(&event.sender) {
            debug!(sender = %event.sender, "ignored sender");
            return false;
        }

        let token = command_token(&event);
        let command = Arc::clone(self.commands.resolve(&token));

        let Some(permit) = self.gate.acquire().await else {
            debug!(id = event.id, "dispatcher closed; event dropped");
            return false;
        };

        let ctx = Arc::clone(&self.ctx);
        let scope = Scope::new(shutdown, self.timeout);
        self.tracker.spawn(async move {
            let _permit = permit;
            let name = command.name().to_string();
            match scope.run(command.handle(&ctx, &event, &scope)).await {
                Ok(Ok(())) => trace!(id = event.id, command = %name, "handled"),
                Ok(Err(e)) => warn!(
                    id = event.id,
                    command = %name,
                    sender = %event.sender,
                    error = %format!("{e:#}"),
                    "handler failed"
                ),
                Err(ScopeError::TimedOut) => {
                    warn!(id = event.id, command = %name, "handler timed out");
                }
                Err(ScopeError::Cancelled) => {
                    debug!(id = event.id, command = %name, "handler cancelled");
                }
            }
        });
        true
    }

    /// Dispatch events from `rx` until `shutdown` or until the sender side is
    /// gone, then wait for in-flight handlers.
    pub async fn run(self, mut rx: mpsc::Receiver<Event>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            max_in_flight = self.gate.max_in_flight(),
            timeout_secs = self.timeout.as_secs(),
            "dispatcher started"
        );

        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                debug!("event stream ended");
                break;
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = self.dispatch(event, &shutdown) => {}
            }
        }

        self.gate.close();
        self.tracker.close();
        self.tracker.wait().await;
        info!("dispatcher stopped");
        Ok(())
    }
}
