use super::{BotContext, Command};
use crate::channels::{Event, Scope};
use crate::daemon::supervisor::ShutdownReason;
use async_trait::async_trait;
use tracing::{info, warn};

/// `!quit`: admin-only orderly shutdown.
pub struct QuitCommand;

#[async_trait]
impl Command for QuitCommand {
    fn name(&self) -> &str {
        "quit"
    }

    async fn handle(&self, ctx: &BotContext, event: &Event, _scope: &Scope) -> anyhow::Result<()> {
        if !ctx.config.is_admin(&event.prefix) {
            warn!(prefix = %event.prefix, "quit from non-admin ignored");
            return Ok(());
        }
        info!(sender = %event.sender, "quit requested");
        ctx.shutdown.request_shutdown(ShutdownReason::AdminQuit);
        Ok(())
    }
}
