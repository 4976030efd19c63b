//! News sources: where the latest headline comes from.
//!
//! Each configured source is one variant of [`SourceKind`], chosen once at
//! startup by [`build`] and used afterwards only through the [`NewsSource`]
//! trait.
//!
//! # Supported Kinds
//!
//! | Kind | Module | Method | Notes |
//! |------|--------|--------|-------|
//! | `html` | [`html`] | HTTP + CSS selectors | Static markup, id from a container attribute |
//! | `next_data` | [`next_data`] | HTTP + embedded JSON | Next.js `__NEXT_DATA__` blob |
//! | `browser` | [`browser`] | WebDriver session + XPath | Script-rendered pages, id from the link |
//!
//! # Common Contract
//!
//! - `fetch_latest()` returns the newest [`Item`] with every field present, or
//!   `None` when the page legitimately lists nothing
//! - a missing structural element is [`FetchError::NotFound`]; network and
//!   driver trouble is a transient error retried by the resource session
//! - `fetch_body(link)` returns the extracted article text or `None`; callers
//!   treat its failure as "post without body"

pub mod body;
pub mod browser;
pub mod html;
pub mod next_data;

use crate::config::{SourceConfig, SourceKind};
use crate::error::{ConfigError, FetchError};
use crate::http::HttpFetcher;
use crate::models::{Item, SourceInfo};
use crate::session::ResourceSession;
use crate::webdriver::WebDriverClient;
use async_trait::async_trait;
use std::sync::Arc;

/// Capability shared by every source kind.
#[async_trait]
pub trait NewsSource: Send + Sync {
    /// Stable source name; keys the persisted dedup record.
    fn name(&self) -> &str;

    /// Page the latest item is read from.
    fn source_url(&self) -> &str;

    /// Fetch the newest item on the page.
    async fn fetch_latest(&self) -> Result<Option<Item>, FetchError>;

    /// Fetch and extract the article body behind `link`.
    async fn fetch_body(&self, link: &str) -> Result<Option<String>, FetchError>;

    fn info(&self) -> SourceInfo {
        SourceInfo {
            name: self.name().to_string(),
            url: self.source_url().to_string(),
        }
    }
}

/// External clients the sources fetch through.
#[derive(Debug, Clone)]
pub struct Backends {
    pub http: HttpFetcher,
    /// Present only when a WebDriver endpoint is configured.
    pub webdriver: Option<WebDriverClient>,
    pub session: ResourceSession,
}

/// Construct the source described by `config`.
///
/// # Errors
///
/// [`ConfigError::Invalid`] for selectors or patterns that do not compile,
/// and for `browser` sources when no WebDriver endpoint is configured.
pub fn build(config: &SourceConfig, backends: &Backends) -> Result<Arc<dyn NewsSource>, ConfigError> {
    let source: Arc<dyn NewsSource> = match &config.kind {
        SourceKind::Html {
            item,
            title,
            link,
            id_attr,
        } => Arc::new(html::HtmlSource::new(
            config,
            html::HtmlRules {
                item,
                title,
                link,
                id_attr,
            },
            backends.http.clone(),
        )?),
        SourceKind::NextData {
            list_key,
            id_key,
            title_key,
            link_key,
        } => Arc::new(next_data::NextDataSource::new(
            config,
            next_data::NextDataKeys {
                list: list_key.clone(),
                id: id_key.clone(),
                title: title_key.clone(),
                link: link_key.clone(),
            },
            backends.http.clone(),
        )?),
        SourceKind::Browser {
            xpath,
            id_pattern,
            wait_secs,
        } => {
            let driver = backends.webdriver.clone().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "source {:?} needs a WebDriver endpoint (--webdriver-url)",
                    config.name
                ))
            })?;
            Arc::new(browser::BrowserSource::new(
                config,
                xpath,
                id_pattern.as_deref(),
                std::time::Duration::from_secs(*wait_secs),
                driver,
                backends.session.clone(),
            )?)
        }
    };
    Ok(source)
}

/// Resolve a possibly relative `href` against the page it came from.
pub(crate) fn resolve_link(base: &url::Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::RetryPolicy;
    use std::time::Duration;

    fn backends(webdriver: bool) -> Backends {
        let policy = RetryPolicy::default();
        Backends {
            http: HttpFetcher::new("test", Duration::from_secs(5), policy).unwrap(),
            webdriver: webdriver.then(|| {
                WebDriverClient::new(
                    "http://localhost:9515",
                    Default::default(),
                    "test",
                    Duration::from_secs(5),
                )
                .unwrap()
            }),
            session: ResourceSession::new(policy),
        }
    }

    const YAML: &str = r#"
sources:
  - { name: a, url: "https://a.example/news", kind: html, item: div.item, title: span, link: a }
  - { name: b, url: "https://b.example/news", kind: next_data, list_key: _newsList }
  - { name: c, url: "https://c.example/news", kind: browser, xpath: "//a" }
"#;

    #[test]
    fn test_build_each_kind() {
        let config = Config::from_yaml(YAML).unwrap();
        let b = backends(true);
        let built: Vec<_> = config.sources.iter().map(|s| build(s, &b).unwrap()).collect();
        let names: Vec<_> = built.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(
            built[1].info(),
            SourceInfo {
                name: "b".into(),
                url: "https://b.example/news".into()
            }
        );
    }

    #[test]
    fn test_browser_source_requires_webdriver() {
        let config = Config::from_yaml(YAML).unwrap();
        let err = build(&config.sources[2], &backends(false)).err().unwrap();
        assert!(err.to_string().contains("WebDriver"));
    }

    #[test]
    fn test_invalid_selector_is_config_error() {
        let yaml = "sources:\n  - { name: a, url: \"https://a.example\", kind: html, item: \"div[\", title: span, link: a }\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(matches!(build(&config.sources[0], &backends(false)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_link() {
        let base = url::Url::parse("https://ru.investing.com/news/latest-news").unwrap();
        assert_eq!(
            resolve_link(&base, "/news/crypto/article-123").unwrap(),
            "https://ru.investing.com/news/crypto/article-123"
        );
        assert_eq!(
            resolve_link(&base, "https://other.example/x").unwrap(),
            "https://other.example/x"
        );
    }
}
