use super::{BotContext, Command, argument};
use crate::channels::{Event, Scope};
use crate::store::StoreError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

const HPA_TO_MMHG: f64 = 0.750_062;

/// Current conditions as returned by the weather service.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Weather {
    #[serde(default)]
    pub weather: Vec<Condition>,
    pub main: Readings,
    #[serde(default)]
    pub wind: Wind,
    #[serde(default)]
    pub sys: Sys,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Readings {
    pub temp: f64,
    /// hPa
    #[serde(default)]
    pub pressure: f64,
    #[serde(default)]
    pub humidity: i64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Wind {
    #[serde(default)]
    pub speed: f64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Sys {
    #[serde(default)]
    pub country: String,
}

impl fmt::Display for Weather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self
            .weather
            .first()
            .map_or("n/a", |c| c.description.as_str());
        write!(
            f,
            "{}/{}: {description}; temperature: {:.1} °C; pressure: {:.1} mmHg; wind: {:.1} m/s; humidity: {}%",
            self.name,
            self.sys.country,
            self.main.temp,
            self.main.pressure * HPA_TO_MMHG,
            self.wind.speed,
            self.main.humidity,
        )
    }
}

/// `!п <alias>`: current weather for a city alias.
pub struct WeatherCommand;

impl WeatherCommand {
    async fn fetch(ctx: &BotContext, scope: &Scope, query: &str) -> anyhow::Result<Weather> {
        let token = ctx
            .config
            .weather_token
            .as_deref()
            .context("weather token is not configured")?;
        let url = Url::parse_with_params(
            &ctx.endpoints.weather,
            &[("units", "metric"), ("lang", "ru"), ("APPID", token), ("q", query)],
        )?;
        let page = ctx.fetcher.get(scope, url.as_str(), "application/json").await?;
        serde_json::from_str(&page.body).context("malformed weather response")
    }
}

#[async_trait]
impl Command for WeatherCommand {
    fn name(&self) -> &str {
        "weather"
    }

    async fn handle(&self, ctx: &BotContext, event: &Event, scope: &Scope) -> anyhow::Result<()> {
        let Some(alias) = argument(event).split_whitespace().next() else {
            return Ok(());
        };

        let city = match scope.run(ctx.store.city(alias)).await? {
            Ok(city) => city,
            Err(StoreError::NotFound) => {
                debug!(alias, "unknown city alias");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let query = city.query();
        let weather = ctx
            .weather
            .get_or_fetch(scope, &query, || Self::fetch(ctx, scope, &query))
            .await;
        match weather {
            Ok(weather) => ctx.reply(scope, event, vec![weather.to_string()]).await,
            Err(e) => {
                warn!(city = %query, error = %format!("{e:#}"), "weather lookup failed");
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
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = r#"{
        "weather": [{"description": "light rain"}],
        "main": {"temp": 4.56, "pressure": 1013, "humidity": 87, "temp_min": 3, "temp_max": 6},
        "wind": {"speed": 3.1, "deg": 200},
        "sys": {"country": "RU"},
        "id": 524901,
        "name": "Moscow",
        "cod": 200
    }"#;

    #[test]
    fn renders_metric_summary() {
        let weather: Weather = serde_json::from_str(BODY).unwrap();
        assert_eq!(
            weather.to_string(),
            "Moscow/RU: light rain; temperature: 4.6 °C; pressure: 759.8 mmHg; wind: 3.1 m/s; humidity: 87%"
        );
    }

    #[tokio::test]
    async fn alias_resolves_and_result_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "Moscow,RU"))
            .and(query_param("APPID", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(BODY, "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let mut h = harness(config());
        h.ctx = h.ctx.with_endpoints(Endpoints {
            weather: format!("{}/data/2.5/weather", server.uri()),
            ..Endpoints::default()
        });
        h.ctx.store.insert_city("мск", "Moscow", "RU").await.unwrap();

        for text in ["!п мск", "!п МСК"] {
            let event = h.conn.public("#mania", "alice!a@host", text);
            WeatherCommand.handle(&h.ctx, &event, &scope()).await.unwrap();
        }

        assert_eq!(h.conn.replies().len(), 2);
        assert!(h.ctx.weather.get("Moscow,RU").is_some());
    }

    #[tokio::test]
    async fn unknown_alias_and_missing_argument_are_silent() {
        let h = harness(config());
        for text in ["!п nowhere", "!п"] {
            let event = h.conn.public("#mania", "alice!a@host", text);
            WeatherCommand.handle(&h.ctx, &event, &scope()).await.unwrap();
        }
        assert!(h.conn.sent().is_empty());
        assert!(h.ctx.weather.is_empty());
    }
}
