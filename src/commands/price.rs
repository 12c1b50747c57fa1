use super::{BotContext, Command};
use crate::channels::{Event, Scope};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::warn;

/// `!btc`, `!eth`, `!xmr`: USD price of one currency.
pub struct PriceCommand {
    currency: String,
}

impl PriceCommand {
    pub fn new(currency: &str) -> Self {
        Self {
            currency: currency.to_lowercase(),
        }
    }

    async fn fetch(&self, ctx: &BotContext, scope: &Scope) -> anyhow::Result<String> {
        let symbol = self.currency.to_uppercase();
        let url = Url::parse_with_params(
            &ctx.endpoints.prices,
            &[("fsyms", symbol.as_str()), ("tsyms", "USD")],
        )?;
        let page = ctx.fetcher.get(scope, url.as_str(), "application/json").await?;
        parse_price(&page.body, &symbol)
    }
}

/// `{"BTC":{"USD":123.456}}` → `"123.46"`.
pub fn parse_price(body: &str, symbol: &str) -> anyhow::Result<String> {
    let json: Value = serde_json::from_str(body).context("price response is not JSON")?;
    let price = json
        .get(symbol)
        .and_then(|quotes| quotes.get("USD"))
        .and_then(Value::as_f64)
        .with_context(|| format!("no USD price for {symbol} in {body:?}"))?;
    Ok(format!("{price:.2}"))
}

#[async_trait]
impl Command for PriceCommand {
    fn name(&self) -> &str {
        &self.currency
    }

    async fn handle(&self, ctx: &BotContext, event: &Event, scope: &Scope) -> anyhow::Result<()> {
        let price = ctx
            .prices
            .get_or_fetch(scope, &self.currency, || self.fetch(ctx, scope))
            .await;
        match price {
            Ok(price) => {
                let line = format!("{}/USD: {price}", self.currency.to_uppercase());
                ctx.reply(scope, event, vec![line]).await
            }
            Err(e) => {
                warn!(currency = %self.currency, error = %format!("{e:#}"), "price lookup failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Endpoints;
    use crate::commands::testing::{config, harness, scope};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_two_decimals() {
        assert_eq!(parse_price(r#"{"BTC":{"USD":43210.987}}"#, "BTC").unwrap(), "43210.99");
        assert!(parse_price(r#"{"Response":"Error"}"#, "BTC").is_err());
        assert!(parse_price("<html>", "BTC").is_err());
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/pricemulti"))
            .and(query_param("fsyms", "ETH"))
            .and(query_param("tsyms", "USD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"ETH":{"USD":2500.5}}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut h = harness(config());
        h.ctx = h.ctx.with_endpoints(Endpoints {
            prices: format!("{}/data/pricemulti", server.uri()),
            ..Endpoints::default()
        });
        let command = PriceCommand::new("ETH");

        for _ in 0..2 {
            let event = h.conn.public("#mania", "alice!a@host", "!eth");
            command.handle(&h.ctx, &event, &scope()).await.unwrap();
        }

        let replies = h.conn.replies();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(_, lines)| lines == &["ETH/USD: 2500.50"]));
        assert_eq!(h.ctx.prices.get("eth").as_deref(), Some("2500.50"));
    }

    #[tokio::test]
    async fn failed_fetch_is_silent_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut h = harness(config());
        h.ctx = h.ctx.with_endpoints(Endpoints {
            prices: format!("{}/data/pricemulti", server.uri()),
            ..Endpoints::default()
        });
        let event = h.conn.public("#mania", "alice!a@host", "!btc");
        PriceCommand::new("btc")
            .handle(&h.ctx, &event, &scope())
            .await
            .unwrap();

        assert!(h.conn.sent().is_empty());
        assert!(h.ctx.prices.is_empty());
    }
}
