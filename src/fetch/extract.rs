//! Minimal text extractors over fetched HTML.

use regex::Regex;
use std::sync::LazyLock;

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title pattern"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern"));
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space pattern"));

/// Content of the first `<title>` element, whitespace-collapsed.
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE.captures(html)?.get(1)?.as_str();
    let title = clean(raw);
    (!title.is_empty()).then_some(title)
}

/// Text of the last match of `pattern` in `html`: its first capture group if
/// it has one, else the whole match. Tags inside are stripped.
pub fn extract_last_match(html: &str, pattern: &Regex) -> Option<String> {
    let caps = pattern.captures_iter(html).last()?;
    let raw = caps.get(1).or_else(|| caps.get(0))?.as_str();
    let text = clean(&TAG.replace_all(raw, " "));
    (!text.is_empty()).then_some(text)
}

fn clean(raw: &str) -> String {
    let text = SPACE.replace_all(raw.trim(), " ");
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
