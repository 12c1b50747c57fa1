use super::{BotContext, Command};
use crate::channels::{Event, Scope};
use async_trait::async_trait;
use tracing::debug;

/// `!status`: runtime health, for admins in private only.
pub struct StatusCommand;

#[async_trait]
impl Command for StatusCommand {
    fn name(&self) -> &str {
        "status"
    }

    async fn handle(&self, ctx: &BotContext, event: &Event, scope: &Scope) -> anyhow::Result<()> {
        if !event.is_private() || !ctx.config.is_admin(&event.prefix) {
            debug!(sender = %event.sender, "status refused");
            return Ok(());
        }
        let summary = ctx.health.snapshot().summary();
        ctx.reply(scope, event, vec![summary]).await
    }
}
