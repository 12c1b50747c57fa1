//! Line-oriented `key = value` configuration format.
//!
//! Keys are case-insensitive, lines whose key starts with `#` are comments,
//! and every directive may be assigned at most once.

use super::schema::{split_list, Config, ConfigError};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

impl Config {
    pub fn from_directives(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let mut seen = HashSet::new();

        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed { line: index + 1 });
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            if !seen.insert(key.clone()) {
                return Err(ConfigError::Repeated(key));
            }
            config.assign(&key, value)?;
        }

        Ok(config)
    }

    fn assign(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let text = || Some(value.to_string());
        match key {
            "nick" => self.nick = value.to_string(),
            "password" => self.password = text(),
            "ident" => self.ident = value.to_string(),
            "realname" => self.realname = value.to_string(),
            "server" => self.server = value.to_string(),
            "channels" => self.channels = split_list(value),
            "timeout" => self.timeout_secs = Some(parse(key, value)?),
            "dbname" => self.dbname = PathBuf::from(value),
            "useragent" => self.user_agent = text(),
            "ignored" => self.ignored = split_list(value),
            "admins" => self.admins = split_list(value),
            "nickservpass" => self.nickserv_pass = text(),
            "weathertoken" => self.weather_token = text(),
            "pubfingerprint" => self.pub_fingerprint = text(),
            "charset" => self.charset = Some(value.parse()?),
            "maxinflight" => self.max_in_flight = Some(parse(key, value)?),
            "backupinterval" => self.backup_interval_secs = Some(parse(key, value)?),
            "newsurl" => self.news_url = text(),
            "newschannel" => self.news_channel = text(),
            "newsminute" => self.news_minute = Some(parse(key, value)?),
            "newspattern" => self.news_pattern = text(),
            "newsprefix" => self.news_prefix = text(),
            "ratelimit" => self.rate_limit_secs = Some(parse(key, value)?),
            "restartdelay" => self.restart_delay_secs = Some(parse(key, value)?),
            other => return Err(ConfigError::Unknown(other.to_string())),
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}
