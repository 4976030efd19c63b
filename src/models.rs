//! Data models for news items as they flow from a source to the channel.
//!
//! - [`Item`]: a normalized `{id, title, link}` headline
//! - [`SourceInfo`]: the name/url pair shown by the `sources` command
//!
//! Items are immutable once fetched and are identified by `id` within the
//! source that produced them.

use serde_json::Value;
use std::fmt;

/// A single news entry, normalized from any source kind.
///
/// All three fields are guaranteed non-empty; use [`Item::new`] to build one
/// from scraped parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Stable identifier derived from the page content (never from the clock).
    pub id: String,
    /// The headline text.
    pub title: String,
    /// Absolute URL of the full article.
    pub link: String,
}

impl Item {
    /// Build an item from scraped parts, trimming whitespace.
    ///
    /// # Returns
    ///
    /// `None` if any field is empty after trimming; callers turn that into a
    /// not-found error instead of emitting a partial item.
    pub fn new(id: impl AsRef<str>, title: impl AsRef<str>, link: impl AsRef<str>) -> Option<Self> {
        let id = normalize_id(id.as_ref())?;
        let title = title.as_ref().trim();
        let link = link.as_ref().trim();
        if title.is_empty() || link.is_empty() {
            return None;
        }
        Some(Item {
            id,
            title: title.to_string(),
            link: link.to_string(),
        })
    }

    /// The text sent to the channel for this item.
    ///
    /// Title and link on separate lines, with the article body in between
    /// when one was extracted.
    pub fn message(&self, body: Option<&str>) -> String {
        match body.map(str::trim).filter(|b| !b.is_empty()) {
            Some(body) => format!("{}\n\n{}\n\n{}", self.title, body, self.link),
            None => format!("{}\n{}", self.title, self.link),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.title)
    }
}

/// Trim an identifier; empty ids are rejected.
pub fn normalize_id(raw: &str) -> Option<String> {
    let id = raw.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Coerce a JSON identifier to its string form.
///
/// Sources disagree on id types (`"2670738"` vs `2670738`); both compare
/// equal once stringified. Objects, arrays, booleans and null are not ids.
pub fn id_from_json(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => normalize_id(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A configured source as presented to the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub url: String,
}
