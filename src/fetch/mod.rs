//! HTTP fetch collaborator used by handlers and the news poller.

pub mod extract;

pub use extract::{extract_last_match, extract_title};

use crate::channels::{Scope, ScopeError};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("ircbot/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("wrong status code {0}")]
    Status(u16),
    #[error("content-type {actual:?} is not {expected:?}")]
    ContentKind { expected: String, actual: String },
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

/// Response body plus whether the server declared it UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub body: String,
    pub utf8: bool,
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// GET `url` under `scope`. Fails unless the status is a success and the
    /// content type matches `expected_kind` (e.g. `text/html`).
    pub async fn get(&self, scope: &Scope, url: &str, expected_kind: &str) -> Result<Fetched, FetchError> {
        scope.run(self.fetch(url, expected_kind)).await?
    }

    async fn fetch(&self, url: &str, expected_kind: &str) -> Result<Fetched, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let header = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let (matches, utf8) = check_content_type(&header, expected_kind);
        if !matches {
            return Err(FetchError::ContentKind {
                expected: expected_kind.to_string(),
                actual: header,
            });
        }

        let bytes = response.bytes().await?;
        Ok(Fetched {
            body: String::from_utf8_lossy(&bytes).into_owned(),
            utf8,
        })
    }
}

/// Whether `header` declares `expected` and whether it declares UTF-8.
fn check_content_type(header: &str, expected: &str) -> (bool, bool) {
    let mut matches = false;
    let mut utf8 = false;
    for value in header.split(';').map(|v| v.trim().to_ascii_lowercase()) {
        if value == expected {
            matches = true;
        } else if value == "charset=utf-8" {
            utf8 = true;
        }
    }
    (matches, utf8)
}
