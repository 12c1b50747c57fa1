use super::{BotContext, Command};
use crate::channels::{Event, Scope};
use crate::fetch::extract_title;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use std::sync::LazyLock;
use tracing::{debug, warn};

const MAX_URLS: usize = 2;

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S{1,500}").expect("url pattern"));

const IGNORED_EXTENSIONS: &[&str] = &[
    ".avi", ".mkv", ".ogg", ".doc", ".docx", ".xls", ".xlsx", ".mp3", ".flac", ".m3a",
    ".torrent", ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".txt", ".rar", ".zip", ".gz", ".bz",
    ".bzip2", ".zstd", ".tgz", ".tar",
];

/// Links found in `text`, at most [`MAX_URLS`]. CTCP markers are dropped first.
pub fn find_urls(text: &str) -> Vec<String> {
    let text = text.replace('\x01', "");
    URL.find_iter(&text)
        .take(MAX_URLS)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn has_ignored_extension(url: &Url) -> bool {
    let path = url.path();
    IGNORED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Fallback for anything that is not a command: reply with the titles of
/// linked pages.
pub struct TitleCommand;

impl TitleCommand {
    async fn title_of(ctx: &BotContext, scope: &Scope, raw: &str) -> anyhow::Result<Option<String>> {
        let Ok(url) = Url::parse(raw) else {
            return Ok(None);
        };
        if has_ignored_extension(&url) {
            return Ok(None);
        }
        if let Some(host) = url.host_str() {
            if scope.run(ctx.store.is_ignored_domain(host)).await?? {
                debug!(host, "ignored domain");
                return Ok(None);
            }
        }
        let page = ctx.fetcher.get(scope, url.as_str(), "text/html").await?;
        Ok(extract_title(&page.body))
    }
}

#[async_trait]
impl Command for TitleCommand {
    fn name(&self) -> &str {
        "title"
    }

    async fn handle(&self, ctx: &BotContext, event: &Event, scope: &Scope) -> anyhow::Result<()> {
        let mut titles = Vec::new();
        for url in find_urls(&event.text()) {
            match Self::title_of(ctx, scope, &url).await {
                Ok(Some(title)) if !title.is_empty() => titles.push(title),
                Ok(_) => {}
                Err(e) => warn!(%url, error = %format!("{e:#}"), "title fetch failed"),
            }
        }

        for title in titles {
            ctx.reply(scope, event, vec![format!("^:: {title}")]).await?;
        }
        Ok(())
    }
}
