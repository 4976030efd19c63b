//! Article body extraction from a rendered article page.

use crate::utils::truncate_chars;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};

/// Fallback containers tried after the configured selectors.
const FALLBACK_SELECTORS: [&str; 2] = ["article", "div.article-content"];

/// Dateline separators (`"MOSCOW - ..."`) are cut only when they appear this
/// close to the start.
const DATELINE_WINDOW: usize = 30;

/// Appended when the body is cut at `max_chars`.
pub const CONTINUE_MARKER: &str = "...";

static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());

/// Per-source rules for pulling readable text out of an article page.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BodyRules {
    /// CSS selectors for the article container, tried in order before the
    /// built-in fallbacks.
    pub selectors: Vec<String>,
    /// Keep only paragraphs after the one containing this text.
    pub start_after: Option<String>,
    /// Stop at the first paragraph containing this text.
    pub stop_before: Option<String>,
    /// Character budget for the posted body.
    pub max_chars: usize,
}

impl Default for BodyRules {
    fn default() -> Self {
        Self {
            selectors: Vec::new(),
            start_after: None,
            stop_before: None,
            max_chars: 2000,
        }
    }
}

impl BodyRules {
    /// Configured selectors followed by the fallbacks, without repeats.
    pub fn candidates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for s in self.selectors.iter().map(String::as_str).chain(FALLBACK_SELECTORS) {
            if !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }

    /// First configured selector, used by browser sources to wait for the
    /// article to render.
    pub fn primary(&self) -> Option<&str> {
        self.selectors.first().map(String::as_str)
    }
}

/// Extract the article text from `html`.
///
/// # Returns
///
/// `None` when no container matches or the container holds no paragraph
/// text. Otherwise paragraphs joined by blank lines, with a leading dateline
/// separator removed and the result cut to `max_chars` plus
/// [`CONTINUE_MARKER`].
pub fn extract_body(html: &str, rules: &BodyRules) -> Option<String> {
    let document = Html::parse_document(html);

    let container = rules.candidates().into_iter().find_map(|css| {
        let selector = match Selector::parse(css) {
            Ok(s) => s,
            Err(e) => {
                warn!(selector = css, error = %e, "Skipping invalid body selector");
                return None;
            }
        };
        let found = document.select(&selector).next();
        if found.is_none() {
            debug!(selector = css, "Body selector matched nothing");
        }
        found
    })?;

    let paragraphs: Vec<String> = container
        .select(&PARAGRAPH)
        .map(|p| p.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let kept = slice_between_markers(&paragraphs, rules);
    let text = strip_dateline(&kept.join("\n\n"));
    if text.is_empty() {
        return None;
    }

    let (cut, truncated) = truncate_chars(&text, rules.max_chars);
    if truncated {
        Some(format!("{}{}", cut.trim_end(), CONTINUE_MARKER))
    } else {
        Some(cut)
    }
}

/// Apply `start_after`/`stop_before`; the slice is used only when both
/// markers are configured and found.
fn slice_between_markers<'a>(paragraphs: &'a [String], rules: &BodyRules) -> &'a [String] {
    let (Some(start_marker), Some(stop_marker)) = (&rules.start_after, &rules.stop_before) else {
        return paragraphs;
    };

    let mut start = None;
    let mut end = None;
    for (i, p) in paragraphs.iter().enumerate() {
        if p.contains(start_marker.as_str()) {
            start = Some(i + 1);
        }
        if p.contains(stop_marker.as_str()) {
            end = Some(i);
            break;
        }
    }

    match (start, end) {
        (Some(s), Some(e)) if s <= e => &paragraphs[s..e],
        (Some(_), Some(_)) => &[],
        _ => paragraphs,
    }
}

/// Drop everything up to a spaced ` - ` found in the first few characters.
/// Hyphenated words (`Bitcoin-ETF`) are left alone.
fn strip_dateline(text: &str) -> String {
    let head: String = text.chars().take(DATELINE_WINDOW).collect();
    match head.find(" - ") {
        Some(byte_idx) => text[byte_idx + 3..].trim_start().to_string(),
        None => text.to_string(),
    }
}
