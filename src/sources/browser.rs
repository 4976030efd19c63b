//! Script-rendered pages read through a leased WebDriver session.
//!
//! Every fetch opens its own browser session through the resource session,
//! waits for the page and the target anchor to render, reads what it needs
//! and closes the session again on every exit path. A transient driver error
//! anywhere in that sequence starts it over in a fresh session.

use super::NewsSource;
use super::body::{BodyRules, extract_body};
use crate::config::SourceConfig;
use crate::error::{ConfigError, FetchError};
use crate::models::Item;
use crate::session::ResourceSession;
use crate::webdriver::{BrowserSession, Locator, WebDriverClient};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct BrowserSource {
    name: String,
    url: String,
    anchor: Locator,
    id_pattern: Option<Regex>,
    wait: Duration,
    body: BodyRules,
    driver: WebDriverClient,
    session: ResourceSession,
}

impl BrowserSource {
    /// # Arguments
    ///
    /// * `xpath` - Anchor of the latest item; its text is the title and its
    ///   `href` the link
    /// * `id_pattern` - Regex over the link whose first capture group is the
    ///   id. Without one, the id is whatever follows the link's last `-`.
    /// * `wait` - How long to wait for the page and the anchor to render
    pub fn new(
        config: &SourceConfig,
        xpath: &str,
        id_pattern: Option<&str>,
        wait: Duration,
        driver: WebDriverClient,
        session: ResourceSession,
    ) -> Result<Self, ConfigError> {
        let id_pattern = id_pattern
            .map(|p| {
                let re = Regex::new(p)
                    .map_err(|e| ConfigError::Invalid(format!("source {:?}: bad id_pattern: {e}", config.name)))?;
                if re.captures_len() < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "source {:?}: id_pattern needs a capture group",
                        config.name
                    )));
                }
                Ok(re)
            })
            .transpose()?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            anchor: Locator::XPath(xpath.to_string()),
            id_pattern,
            wait,
            body: config.body.clone(),
            driver,
            session,
        })
    }
}

/// Derive an item id from its link.
pub fn id_from_link(link: &str, pattern: Option<&Regex>) -> Option<String> {
    match pattern {
        Some(re) => re
            .captures(link)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        None => link
            .trim_end_matches('/')
            .rsplit('-')
            .next()
            .map(str::to_string),
    }
    .filter(|id| !id.trim().is_empty())
}

fn body_locator() -> Locator {
    Locator::Css("body".to_string())
}

#[async_trait]
impl NewsSource for BrowserSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_url(&self) -> &str {
        &self.url
    }

    #[instrument(level = "info", skip_all, fields(source = %self.name))]
    async fn fetch_latest(&self) -> Result<Option<Item>, FetchError> {
        let url = self.url.clone();
        let anchor = self.anchor.clone();
        let id_pattern = self.id_pattern.clone();
        let wait = self.wait;

        let item = self
            .session
            .scoped(
                &self.name,
                || self.driver.open_session(),
                |browser: &BrowserSession| {
                    let url = url.clone();
                    let anchor = anchor.clone();
                    let id_pattern = id_pattern.clone();
                    Box::pin(async move {
                        browser.navigate(&url).await?;
                        browser.wait_for(&body_locator(), wait).await?;
                        let el = browser.wait_for(&anchor, wait).await?;

                        let title = browser.text(&el).await?;
                        let link = browser
                            .attribute(&el, "href")
                            .await?
                            .ok_or_else(|| FetchError::not_found(&url, "anchor href"))?;
                        let id = id_from_link(&link, id_pattern.as_ref())
                            .ok_or_else(|| FetchError::not_found(&url, format!("item id in {link}")))?;
                        debug!(%id, %title, %link, "Found news item");

                        Item::new(id, title, link).ok_or_else(|| FetchError::not_found(&url, "non-empty item fields"))
                    })
                },
            )
            .await?;
        info!(id = %item.id, "Fetched latest item");
        Ok(Some(item))
    }

    #[instrument(level = "info", skip_all, fields(source = %self.name, %link))]
    async fn fetch_body(&self, link: &str) -> Result<Option<String>, FetchError> {
        let link = link.to_string();
        let primary = self.body.primary().map(|css| Locator::Css(css.to_string()));
        let wait = self.wait;

        let html = self
            .session
            .scoped(
                &self.name,
                || self.driver.open_session(),
                |browser: &BrowserSession| {
                    let link = link.clone();
                    let primary = primary.clone();
                    Box::pin(async move {
                        browser.navigate(&link).await?;
                        browser.wait_for(&body_locator(), wait).await?;
                        if let Some(primary) = &primary {
                            // The extractor falls back to other containers.
                            match browser.wait_for(primary, wait).await {
                                Ok(_) | Err(FetchError::NotFound { .. }) => {}
                                Err(e) => return Err(e),
                            }
                        }
                        browser.page_source().await
                    })
                },
            )
            .await?;
        Ok(extract_body(&html, &self.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::session::RetryPolicy;
    use crate::webdriver::BrowserKind;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{Method, StatusCode, Uri};
    use axum::response::Json;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn config() -> SourceConfig {
        SourceConfig {
            name: "investing_popular".into(),
            url: "https://ru.investing.com/news/most-popular-news".into(),
            kind: SourceKind::Browser {
                xpath: String::new(),
                id_pattern: None,
                wait_secs: 60,
            },
            body: BodyRules::default(),
        }
    }

    fn build(pattern: Option<&str>) -> Result<BrowserSource, ConfigError> {
        let driver = WebDriverClient::new(
            "http://localhost:9515",
            BrowserKind::Chrome,
            "test",
            Duration::from_secs(5),
        )
        .unwrap();
        BrowserSource::new(
            &config(),
            "//ul/li[1]/article/div/a",
            pattern,
            Duration::from_secs(60),
            driver,
            ResourceSession::new(RetryPolicy::default()),
        )
    }

    /// WebDriver endpoint double: records every command, fails the first
    /// `nav_failures` navigations with `unknown error` and can stall the
    /// timeouts call.
    struct FakeDriver {
        log: Mutex<Vec<String>>,
        sessions: AtomicUsize,
        nav_failures: AtomicUsize,
        timeouts_delay: Duration,
    }

    impl FakeDriver {
        fn new(nav_failures: usize, timeouts_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                sessions: AtomicUsize::new(0),
                nav_failures: AtomicUsize::new(nav_failures),
                timeouts_delay,
            })
        }

        fn requests(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn count(&self, pred: impl Fn(&str) -> bool) -> usize {
            self.requests().iter().filter(|r| pred(r)).count()
        }
    }

    fn ok(value: Value) -> (StatusCode, Json<Value>) {
        (StatusCode::OK, Json(json!({ "value": value })))
    }

    async fn handle(State(driver): State<Arc<FakeDriver>>, method: Method, uri: Uri) -> (StatusCode, Json<Value>) {
        let path = uri.path().to_string();
        driver.log.lock().unwrap().push(format!("{method} {path}"));
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        match (method.as_str(), parts.as_slice()) {
            ("POST", ["session"]) => {
                let n = driver.sessions.fetch_add(1, Ordering::SeqCst) + 1;
                ok(json!({ "sessionId": format!("s{n}"), "capabilities": {} }))
            }
            ("POST", ["session", _, "timeouts"]) => {
                tokio::time::sleep(driver.timeouts_delay).await;
                ok(Value::Null)
            }
            ("POST", ["session", _, "url"]) => {
                let failing = driver
                    .nav_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "value": { "error": "unknown error", "message": "net::ERR_CONNECTION_RESET" } })),
                    )
                } else {
                    ok(Value::Null)
                }
            }
            ("POST", ["session", _, "element"]) => ok(json!({ "element-6066-11e4-a52e-4f735466cecf": "el-1" })),
            ("GET", ["session", _, "element", _, "text"]) => ok(json!("Bitcoin rallies")),
            ("GET", ["session", _, "element", _, "attribute", "href"]) => {
                ok(json!("https://x.example/news/article-42"))
            }
            ("DELETE", ["session", _]) => ok(Value::Null),
            _ => (
                StatusCode::NOT_FOUND,
                Json(json!({ "value": { "error": "unknown command", "message": uri.path() } })),
            ),
        }
    }

    async fn spawn_driver(driver: Arc<FakeDriver>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(driver);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn source_against(base: &str, policy: RetryPolicy) -> BrowserSource {
        let driver = WebDriverClient::new(base, BrowserKind::Chrome, "test", Duration::from_secs(5)).unwrap();
        BrowserSource::new(
            &config(),
            "//ul/li[1]/article/div/a",
            None,
            Duration::from_secs(1),
            driver,
            ResourceSession::new(policy),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_transient_navigation_error_retried_in_fresh_session() {
        let driver = FakeDriver::new(2, Duration::ZERO);
        let base = spawn_driver(driver.clone()).await;
        let source = source_against(&base, RetryPolicy::new(3, Duration::from_millis(10)));

        let item = source.fetch_latest().await.unwrap().unwrap();
        assert_eq!(item.id, "42");
        assert_eq!(item.title, "Bitcoin rallies");

        assert_eq!(driver.count(|r| r.starts_with("POST") && r.ends_with("/url")), 3);
        assert_eq!(driver.count(|r| r == "POST /session"), 3);
        assert_eq!(driver.count(|r| r.starts_with("DELETE")), 3, "every session closed");
    }

    #[tokio::test]
    async fn test_navigation_failures_exhaust_budget() {
        let driver = FakeDriver::new(usize::MAX, Duration::ZERO);
        let base = spawn_driver(driver.clone()).await;
        let source = source_against(&base, RetryPolicy::new(3, Duration::from_millis(10)));

        let err = source.fetch_latest().await.unwrap_err();
        assert!(matches!(err, FetchError::ResourceUnavailable { attempts: 3, .. }), "{err:?}");
        assert_eq!(driver.count(|r| r == "POST /session"), 3);
        assert_eq!(driver.count(|r| r.starts_with("DELETE")), 3);
    }

    #[tokio::test]
    async fn test_session_deleted_when_cancelled_during_setup() {
        let driver = FakeDriver::new(0, Duration::from_secs(3));
        let base = spawn_driver(driver.clone()).await;
        let source = source_against(&base, RetryPolicy::new(1, Duration::ZERO));

        let res = tokio::time::timeout(Duration::from_millis(300), source.fetch_latest()).await;
        assert!(res.is_err(), "setup should have been cut off");

        // The drop guard deletes the session in the background.
        for _ in 0..100 {
            if driver.count(|r| r == "DELETE /session/s1") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            driver.requests(),
            vec!["POST /session", "POST /session/s1/timeouts", "DELETE /session/s1"]
        );
    }

    #[test]
    fn test_default_id_is_last_dash_segment() {
        assert_eq!(
            id_from_link("https://ru.investing.com/news/economy/article-2670738", None),
            Some("2670738".to_string())
        );
        assert_eq!(
            id_from_link("https://x.example/news/bitcoin-etf-flows-91/", None),
            Some("91".to_string())
        );
    }

    #[test]
    fn test_pattern_capture_group() {
        let re = Regex::new(r"/news/(\d+)").unwrap();
        assert_eq!(
            id_from_link("https://x.example/news/123/slug", Some(&re)),
            Some("123".to_string())
        );
        assert_eq!(id_from_link("https://x.example/about", Some(&re)), None);
    }

    #[test]
    fn test_rejects_bad_patterns() {
        assert!(build(Some(r"\d+")).is_err(), "no capture group");
        assert!(build(Some(r"(\d+")).is_err(), "does not compile");
        assert!(build(Some(r"article-(\d+)")).is_ok());
        assert!(build(None).is_ok());
    }
}
