use super::{BotContext, Command, argument};
use crate::channels::{Event, Scope};
use crate::store::StoreError;
use async_trait::async_trait;
use tracing::{debug, warn};

/// `!bash [id]`: a stored quote by id, or a random one without an id or with 0.
pub struct QuoteCommand;

#[async_trait]
impl Command for QuoteCommand {
    fn name(&self) -> &str {
        "bash"
    }

    async fn handle(&self, ctx: &BotContext, event: &Event, scope: &Scope) -> anyhow::Result<()> {
        if !ctx.limiter.try_acquire(event.reply_target(), event.is_private()) {
            debug!(target = event.reply_target(), "quote rate limited");
            return Ok(());
        }

        let arg = argument(event).split_whitespace().next().unwrap_or("");
        let id: i64 = if arg.is_empty() {
            0
        } else {
            match arg.parse() {
                Ok(id) => id,
                Err(e) => {
                    debug!(arg, error = %e, "unparsable quote id");
                    return Ok(());
                }
            }
        };
        if id < 0 {
            return Ok(());
        }
        // Zero asks for any quote.
        if id == 0 {
            let quote = scope.run(ctx.store.random_quote()).await??;
            return ctx.reply(scope, event, quote.reply_lines()).await;
        }

        match scope.run(ctx.store.quote(id)).await? {
            Ok(quote) => ctx.reply(scope, event, quote.reply_lines()).await,
            Err(e) => {
                if !matches!(e, StoreError::NotFound) {
                    warn!(id, error = %e, "quote lookup failed");
                }
                ctx.reply(scope, event, vec![format!("No quote with id {id}")])
                    .await
            }
        }
    }
}
