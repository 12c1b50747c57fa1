//! Command handlers and the context they run against.

pub mod price;
pub mod quit;
pub mod quote;
pub mod status;
pub mod title;
pub mod weather;

use crate::channels::{Connection, Event, Scope};
use crate::concurrency::{
    PRICE_SWEEP_INTERVAL, PRICE_TTL, RateLimiter, SweepPolicy, TtlCache, WEATHER_SWEEP_INTERVAL,
    WEATHER_TTL,
};
use crate::config::Config;
use crate::daemon::supervisor::ShutdownHandle;
use crate::fetch::HttpFetcher;
use crate::health::HealthRegistry;
use crate::state::SharedHandle;
use crate::store::Store;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weather::Weather;

pub const CRYPTOCOMPARE_URL: &str = "https://min-api.cryptocompare.com/data/pricemulti";
pub const OPENWEATHERMAP_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

/// Base URLs of the JSON services the handlers call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub prices: String,
    pub weather: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            prices: CRYPTOCOMPARE_URL.into(),
            weather: OPENWEATHERMAP_URL.into(),
        }
    }
}

/// Everything a handler may touch. Cheap to share; one per runtime.
pub struct BotContext {
    pub config: Arc<Config>,
    pub connection: Arc<dyn Connection>,
    pub store: Store,
    pub fetcher: HttpFetcher,
    pub limiter: RateLimiter,
    pub weather: TtlCache<Weather>,
    pub prices: TtlCache<String>,
    pub state: SharedHandle,
    pub shutdown: ShutdownHandle,
    pub health: HealthRegistry,
    pub endpoints: Endpoints,
}

impl BotContext {
    pub fn new(
        config: Arc<Config>,
        connection: Arc<dyn Connection>,
        store: Store,
        state: SharedHandle,
        shutdown: ShutdownHandle,
        health: HealthRegistry,
    ) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.user_agent(), config.timeout())
            .context("cannot build HTTP client")?;
        let limiter = RateLimiter::new(SharedHandle::clone(&state), config.rate_limit());
        let weather = TtlCache::new(
            "weather",
            SharedHandle::clone(&state),
            |s| &mut s.weather,
            SweepPolicy::Selective,
            WEATHER_TTL,
            WEATHER_SWEEP_INTERVAL,
        );
        let prices = TtlCache::new(
            "prices",
            SharedHandle::clone(&state),
            |s| &mut s.prices,
            SweepPolicy::FullFlush,
            PRICE_TTL,
            PRICE_SWEEP_INTERVAL,
        );

        Ok(Self {
            config,
            connection,
            store,
            fetcher,
            limiter,
            weather,
            prices,
            state,
            shutdown,
            health,
            endpoints: Endpoints::default(),
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub async fn reply(&self, scope: &Scope, event: &Event, lines: Vec<String>) -> anyhow::Result<()> {
        self.connection.reply(scope, event, &lines).await
    }
}

/// One chat command. Errors are logged by the dispatcher and never reach the
/// sender.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &BotContext, event: &Event, scope: &Scope) -> anyhow::Result<()>;
}

/// Static token → handler table with a fallback for everything else.
#[derive(Clone)]
pub struct CommandTable {
    commands: HashMap<String, Arc<dyn Command>>,
    default: Arc<dyn Command>,
}

impl CommandTable {
    pub fn new(default: Arc<dyn Command>) -> Self {
        Self {
            commands: HashMap::new(),
            default,
        }
    }

    /// Register `command` under `token`, which is matched lower-cased.
    pub fn register(mut self, token: &str, command: Arc<dyn Command>) -> Self {
        self.commands.insert(token.to_lowercase(), command);
        self
    }

    pub fn get(&self, token: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(token)
    }

    pub fn resolve(&self, token: &str) -> &Arc<dyn Command> {
        self.commands.get(token).unwrap_or(&self.default)
    }

    pub fn tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        tokens.sort_unstable();
        tokens
    }
}

/// The bot's command set.
pub fn command_table() -> CommandTable {
    CommandTable::new(Arc::new(title::TitleCommand))
        .register("!bash", Arc::new(quote::QuoteCommand))
        .register("!btc", Arc::new(price::PriceCommand::new("btc")))
        .register("!eth", Arc::new(price::PriceCommand::new("eth")))
        .register("!xmr", Arc::new(price::PriceCommand::new("xmr")))
        .register("!п", Arc::new(weather::WeatherCommand))
        .register("!status", Arc::new(status::StatusCommand))
        .register("!quit", Arc::new(quit::QuitCommand))
}

/// Text after the command token on the first line.
pub fn argument(event: &Event) -> &str {
    let line = event.first_line().trim_start();
    line.split_once(char::is_whitespace)
        .map_or("", |(_, rest)| rest.trim())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::channels::MemoryConnection;
    use crate::state::SharedState;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    pub struct Harness {
        pub ctx: BotContext,
        pub conn: Arc<MemoryConnection>,
        pub _tmp: TempDir,
    }

    pub fn config() -> Config {
        Config {
            nick: "gobot".into(),
            ident: "gobot".into(),
            realname: "Go Bot".into(),
            server: "irc.example.net:6697".into(),
            channels: vec!["#mania".into()],
            dbname: "bot.db".into(),
            admins: vec!["root@admin.host".into()],
            ignored: vec!["spambot".into()],
            weather_token: Some("secret".into()),
            ..Config::default()
        }
    }

    pub fn harness(config: Config) -> Harness {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("bot.db")).unwrap();
        let conn = Arc::new(MemoryConnection::new());
        let ctx = BotContext::new(
            Arc::new(config),
            conn.clone(),
            store,
            SharedState::shared(),
            ShutdownHandle::new(),
            HealthRegistry::new(),
        )
        .unwrap();
        Harness {
            ctx,
            conn,
            _tmp: tmp,
        }
    }

    pub fn scope() -> Scope {
        Scope::new(&CancellationToken::new(), Duration::from_secs(5))
    }
}
