//! YAML configuration for polling settings and the source list.
//!
//! # Example
//!
//! ```yaml
//! period_secs: 1800
//! fetch_timeout_secs: 180
//! include_body: true
//! retry:
//!   max_attempts: 3
//!   retry_delay_secs: 5
//! sources:
//!   - name: rbc_crypto
//!     url: https://www.rbc.ru/crypto/
//!     kind: html
//!     item: div.item.js-rm-central-column-item.item_big
//!     title: span.item__title
//!     link: a.item__link
//!     id_attr: data-id
//!   - name: investing_latest
//!     url: https://ru.investing.com/news/latest-news
//!     kind: next_data
//!     list_key: _newsList
//!     id_key: article_ID
//!     link_key: href
//!   - name: investing_popular
//!     url: https://ru.investing.com/news/most-popular-news
//!     kind: browser
//!     xpath: //ul/li[1]/article/div/a
//!     body:
//!       selectors: ["#leftColumn > div.WYSIWYG.articlePage"]
//!       start_after: "Позиция успешно добавлена"
//!       stop_before: "Читайте оригинальную статью на сайте"
//! ```

use crate::error::ConfigError;
use crate::http::DEFAULT_USER_AGENT;
use crate::session::RetryPolicy;
use crate::sources::body::BodyRules;
use crate::webdriver::BrowserKind;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds between the starts of two poll cycles.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Per-source budget for one fetch (including retries).
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Whether to extract and post the article body with each headline.
    #[serde(default = "default_include_body")]
    pub include_body: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Browser requested from the WebDriver endpoint for `browser` sources.
    #[serde(default)]
    pub browser: BrowserKind,

    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

/// One news source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Stable name; also keys the persisted last-announced id.
    pub name: String,
    pub url: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default)]
    pub body: BodyRules,
}

/// How a source's latest item is located on its page.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Static markup: CSS selectors over the fetched HTML.
    Html {
        /// Container of the latest item.
        item: String,
        /// Title element, relative to the container.
        title: String,
        /// Anchor carrying `href`, relative to the container.
        link: String,
        /// Container attribute holding the item id.
        #[serde(default = "default_id_attr")]
        id_attr: String,
    },
    /// Next.js pages: the `__NEXT_DATA__` JSON blob embedded in the HTML.
    NextData {
        /// Key of the news list, searched anywhere in the JSON tree.
        list_key: String,
        #[serde(default = "default_id_key")]
        id_key: String,
        #[serde(default = "default_title_key")]
        title_key: String,
        #[serde(default = "default_link_key")]
        link_key: String,
    },
    /// Script-rendered pages, read through a WebDriver session.
    Browser {
        /// XPath of the anchor of the latest item.
        xpath: String,
        /// Regex over the link whose first capture group is the id.
        #[serde(default)]
        id_pattern: Option<String>,
        /// How long to wait for the page and the anchor to appear.
        #[serde(default = "default_wait_secs")]
        wait_secs: u64,
    },
}

fn default_period_secs() -> u64 {
    1800
}

fn default_fetch_timeout_secs() -> u64 {
    180
}

fn default_include_body() -> bool {
    true
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_id_attr() -> String {
    "data-id".to_string()
}

fn default_id_key() -> String {
    "id".to_string()
}

fn default_title_key() -> String {
    "title".to_string()
}

fn default_link_key() -> String {
    "link".to_string()
}

fn default_wait_secs() -> u64 {
    60
}

impl Config {
    /// Read, parse and validate a YAML config file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_yaml(&text)?;
        info!(sources = config.sources.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.period_secs == 0 {
            return Err(ConfigError::Invalid("period_secs must be positive".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch_timeout_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no sources configured".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("source with url {} has no name", source.url)));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source name {:?}", source.name)));
            }
            url::Url::parse(&source.url)
                .map_err(|e| ConfigError::Invalid(format!("source {:?}: bad url: {e}", source.name)))?;
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_secs(self.retry.retry_delay_secs),
        )
    }

    pub fn has_browser_sources(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.kind, SourceKind::Browser { .. }))
    }
}
