use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;
pub const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_NEWS_MINUTE: u32 = 21;
pub const DEFAULT_RATE_LIMIT_SECS: u64 = 60;
pub const DEFAULT_NEWS_PREFIX: &str = "news:";

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line {line}: expected `key = value`")]
    Malformed { line: usize },
    #[error("unknown directive `{0}`")]
    Unknown(String),
    #[error("repeated `{0}` assignment")]
    Repeated(String),
    #[error("`{0}` must be specified")]
    Missing(&'static str),
    #[error("`{value}` is not a valid value for `{key}`")]
    Invalid { key: String, value: String },
}

// ── Charset ─────────────────────────────────────────────────────

/// Single-byte charset the connection transcodes from/to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Charset {
    Windows1250,
    Windows1251,
    Windows1252,
    Windows1253,
    Windows1254,
    Windows1255,
    Windows1256,
    Windows1257,
    Windows1258,
    Koi8R,
    Koi8U,
}

impl Charset {
    pub fn name(self) -> &'static str {
        match self {
            Self::Windows1250 => "windows-1250",
            Self::Windows1251 => "windows-1251",
            Self::Windows1252 => "windows-1252",
            Self::Windows1253 => "windows-1253",
            Self::Windows1254 => "windows-1254",
            Self::Windows1255 => "windows-1255",
            Self::Windows1256 => "windows-1256",
            Self::Windows1257 => "windows-1257",
            Self::Windows1258 => "windows-1258",
            Self::Koi8R => "koi8r",
            Self::Koi8U => "koi8u",
        }
    }
}

impl FromStr for Charset {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let code = normalized
            .strip_prefix("windows-")
            .or_else(|| normalized.strip_prefix("cp"));
        let charset = match (code, normalized.as_str()) {
            (Some("1250"), _) => Self::Windows1250,
            (Some("1251"), _) => Self::Windows1251,
            (Some("1252"), _) => Self::Windows1252,
            (Some("1253"), _) => Self::Windows1253,
            (Some("1254"), _) => Self::Windows1254,
            (Some("1255"), _) => Self::Windows1255,
            (Some("1256"), _) => Self::Windows1256,
            (Some("1257"), _) => Self::Windows1257,
            (Some("1258"), _) => Self::Windows1258,
            (None, "koi8r" | "koi8-r") => Self::Koi8R,
            (None, "koi8u" | "koi8-u") => Self::Koi8U,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "charset".into(),
                    value: value.to_string(),
                });
            }
        };
        Ok(charset)
    }
}

impl TryFrom<String> for Charset {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Charset> for String {
    fn from(charset: Charset) -> Self {
        charset.name().to_string()
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Top-level config ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub realname: String,
    /// `host:port` of the chat server
    #[serde(default)]
    pub server: String,
    #[serde(default, deserialize_with = "comma_list")]
    pub channels: Vec<String>,
    /// Single-operation timeout in seconds; unset or zero means the default
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub dbname: PathBuf,
    #[serde(default, rename = "useragent")]
    pub user_agent: Option<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub ignored: Vec<String>,
    /// `user@host` masks allowed to run admin commands
    #[serde(default, deserialize_with = "comma_list")]
    pub admins: Vec<String>,
    #[serde(default, rename = "nickservpass")]
    pub nickserv_pass: Option<String>,
    #[serde(default, rename = "weathertoken")]
    pub weather_token: Option<String>,
    #[serde(default)]
    pub charset: Option<Charset>,
    #[serde(default, rename = "pubfingerprint")]
    pub pub_fingerprint: Option<String>,

    /// Upper bound on simultaneously running dispatches
    #[serde(default, rename = "maxinflight")]
    pub max_in_flight: Option<usize>,
    #[serde(default, rename = "backupinterval")]
    pub backup_interval_secs: Option<u64>,
    #[serde(default, rename = "newsurl")]
    pub news_url: Option<String>,
    #[serde(default, rename = "newschannel")]
    pub news_channel: Option<String>,
    #[serde(default, rename = "newsminute")]
    pub news_minute: Option<u32>,
    #[serde(default, rename = "newspattern")]
    pub news_pattern: Option<String>,
    #[serde(default, rename = "newsprefix")]
    pub news_prefix: Option<String>,
    #[serde(default, rename = "ratelimit")]
    pub rate_limit_secs: Option<u64>,
    #[serde(default, rename = "restartdelay")]
    pub restart_delay_secs: Option<u64>,
}

/// Accepts either `"a,b,c"` or `["a", "b", "c"]`.
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Csv(String),
        Items(Vec<String>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Csv(csv) => split_list(&csv),
        Repr::Items(items) => items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    })
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load from disk. `*.toml` files are TOML; anything else uses the
    /// `key = value` directive format.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::from_directives(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment variable overrides for secrets
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(password) = non_empty("IRCBOT_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(pass) = non_empty("IRCBOT_NICKSERVPASS") {
            self.nickserv_pass = Some(pass);
        }
        if let Some(token) = non_empty("IRCBOT_WEATHERTOKEN") {
            self.weather_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dbname.as_os_str().is_empty() {
            return Err(ConfigError::Missing("dbname"));
        }
        for (name, value) in [
            ("nick", &self.nick),
            ("ident", &self.ident),
            ("realname", &self.realname),
            ("server", &self.server),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Missing("channels"));
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid {
                key: "maxinflight".into(),
                value: "0".into(),
            });
        }
        if let Some(minute) = self.news_minute {
            if minute >= 60 {
                return Err(ConfigError::Invalid {
                    key: "newsminute".into(),
                    value: minute.to_string(),
                });
            }
        }
        if let Some(pattern) = self.news_pattern.as_deref() {
            if regex::Regex::new(pattern).is_err() {
                return Err(ConfigError::Invalid {
                    key: "newspattern".into(),
                    value: pattern.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(
            self.backup_interval_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_BACKUP_INTERVAL_SECS),
        )
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit_secs.unwrap_or(DEFAULT_RATE_LIMIT_SECS))
    }

    pub fn restart_delay(&self) -> Option<Duration> {
        self.restart_delay_secs.map(Duration::from_secs)
    }

    pub fn news_minute(&self) -> u32 {
        self.news_minute.unwrap_or(DEFAULT_NEWS_MINUTE)
    }

    pub fn news_prefix(&self) -> &str {
        self.news_prefix.as_deref().unwrap_or(DEFAULT_NEWS_PREFIX)
    }

    /// Destination the poller announces to.
    pub fn news_channel(&self) -> Option<&str> {
        self.news_channel
            .as_deref()
            .or_else(|| self.channels.first().map(String::as_str))
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent
            .as_deref()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or(crate::fetch::DEFAULT_USER_AGENT)
    }

    /// Snapshot target: `<dbname>.backup` next to the live database.
    pub fn snapshot_path(&self) -> PathBuf {
        let mut name = self.dbname.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    pub fn is_ignored(&self, nick: &str) -> bool {
        self.ignored.iter().any(|ignored| ignored == nick)
    }

    /// `prefix` is the full `nick!user@host` sender mask.
    pub fn is_admin(&self, prefix: &str) -> bool {
        let Some((_, mask)) = prefix.split_once('!') else {
            return false;
        };
        self.admins.iter().any(|admin| admin == mask)
    }
}
