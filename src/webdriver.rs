//! Minimal W3C WebDriver client for rendering script-heavy pages.
//!
//! Some sources only fill in their headline list after client-side scripts
//! run, so a plain GET sees an empty shell. For those we drive a headless
//! browser through any WebDriver endpoint (chromedriver, geckodriver,
//! msedgedriver, a Selenium grid or a Browserless instance).
//!
//! Only the handful of commands the sources need are implemented:
//! new session, timeouts, navigate, find element, element text/attribute,
//! page source and delete session.
//!
//! A [`BrowserSession`] holds a live remote session and implements
//! [`Resource`], so it is always leased through
//! [`ResourceSession`](crate::session::ResourceSession) and deleted on every
//! exit path.

use crate::error::FetchError;
use crate::session::{Lease, Resource};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

/// W3C element reference key in find-element responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// How often [`BrowserSession::wait_for`] re-queries the DOM.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which browser the driver endpoint should start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Firefox,
    Edge,
}

impl BrowserKind {
    /// `capabilities.alwaysMatch` for a headless, automation-quiet session.
    fn capabilities(self, user_agent: &str) -> Value {
        match self {
            BrowserKind::Chrome => json!({
                "browserName": "chrome",
                "goog:chromeOptions": {
                    "args": chromium_args(user_agent),
                    "excludeSwitches": ["enable-automation"],
                },
            }),
            BrowserKind::Edge => json!({
                "browserName": "MicrosoftEdge",
                "ms:edgeOptions": {
                    "args": chromium_args(user_agent),
                    "excludeSwitches": ["enable-automation"],
                },
            }),
            BrowserKind::Firefox => json!({
                "browserName": "firefox",
                "moz:firefoxOptions": {
                    "args": ["-headless"],
                    "prefs": { "general.useragent.override": user_agent },
                },
            }),
        }
    }
}

fn chromium_args(user_agent: &str) -> Vec<String> {
    vec![
        "--headless=new".to_string(),
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        format!("--user-agent={user_agent}"),
    ]
}

/// How to locate an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    fn strategy(&self) -> (&'static str, &str) {
        match self {
            Locator::Css(s) => ("css selector", s),
            Locator::XPath(s) => ("xpath", s),
        }
    }
}

/// Opaque handle to an element inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(String);

/// Connection settings for a WebDriver endpoint.
#[derive(Debug, Clone)]
pub struct WebDriverClient {
    http: Client,
    base_url: String,
    browser: BrowserKind,
    user_agent: String,
    page_load_timeout: Duration,
}

impl WebDriverClient {
    /// # Arguments
    ///
    /// * `base_url` - Driver endpoint, e.g. `http://localhost:9515`
    /// * `browser` - Browser to request in the new-session capabilities
    /// * `user_agent` - User agent the browser should present
    /// * `page_load_timeout` - Per-navigation limit enforced by the driver
    pub fn new(
        base_url: &str,
        browser: BrowserKind,
        user_agent: &str,
        page_load_timeout: Duration,
    ) -> Result<Self, FetchError> {
        // Driver calls block for up to the page-load limit, plus slack for
        // session startup.
        let http = Client::builder()
            .timeout(page_load_timeout + Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            browser,
            user_agent: user_agent.to_string(),
            page_load_timeout,
        })
    }

    /// Start a new browser session.
    ///
    /// If the session is created but configuring it fails or is cancelled,
    /// the session is deleted so no browser is left running.
    #[instrument(level = "info", skip_all, fields(endpoint = %self.base_url))]
    pub async fn open_session(&self) -> Result<BrowserSession, FetchError> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": self.browser.capabilities(&self.user_agent),
            },
        });
        let value = send_command(&self.http, Method::POST, &format!("{}/session", self.base_url), Some(body)).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Transport("new session response carried no sessionId".to_string()))?;

        // Guarded until fully configured: a caller timing out here still
        // gets the remote session deleted.
        let session = Lease::new(
            BrowserSession {
                http: self.http.clone(),
                url: format!("{}/session/{}", self.base_url, session_id),
            },
            "browser session",
        );
        info!(session = %session_id, browser = ?self.browser, "Browser session opened");

        let timeouts = json!({
            "implicit": 2_000,
            "pageLoad": self.page_load_timeout.as_millis() as u64,
        });
        if let Err(e) = session.command(Method::POST, "/timeouts", Some(timeouts)).await {
            warn!(error = %e, "Configuring session timeouts failed; closing session");
            session.release().await;
            return Err(e);
        }
        Ok(session.into_inner())
    }
}

/// A live remote browser session.
#[derive(Debug)]
pub struct BrowserSession {
    http: Client,
    /// `{base}/session/{id}`
    url: String,
}

impl BrowserSession {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, FetchError> {
        send_command(&self.http, method, &format!("{}{}", self.url, path), body).await
    }

    pub async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        debug!(%url, "Navigating");
        self.command(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        Ok(())
    }

    /// Find the first element matching `locator`, or `None` if there is none.
    pub async fn find_element(&self, locator: &Locator) -> Result<Option<ElementRef>, FetchError> {
        let (using, value) = locator.strategy();
        match self
            .command(Method::POST, "/element", Some(json!({ "using": using, "value": value })))
            .await
        {
            Ok(v) => element_ref(&v)
                .map(Some)
                .ok_or_else(|| FetchError::Transport("find element response carried no element".to_string())),
            Err(FetchError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll for an element until it shows up or `timeout` elapses.
    pub async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<ElementRef, FetchError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(el) = self.find_element(locator).await? {
                return Ok(el);
            }
            if Instant::now() >= deadline {
                let (_, value) = locator.strategy();
                return Err(FetchError::not_found(self.current_url().await.unwrap_or_default(), value));
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub async fn text(&self, el: &ElementRef) -> Result<String, FetchError> {
        let v = self.command(Method::GET, &format!("/element/{}/text", el.0), None).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    pub async fn attribute(&self, el: &ElementRef, name: &str) -> Result<Option<String>, FetchError> {
        let v = self
            .command(Method::GET, &format!("/element/{}/attribute/{}", el.0, name), None)
            .await?;
        Ok(v.as_str().map(str::to_string))
    }

    /// Serialized DOM of the current page.
    pub async fn page_source(&self) -> Result<String, FetchError> {
        let v = self.command(Method::GET, "/source", None).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    pub async fn current_url(&self) -> Result<String, FetchError> {
        let v = self.command(Method::GET, "/url", None).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl Resource for BrowserSession {
    async fn release(self) {
        match self.http.delete(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => debug!(session = %self.url, "Browser session closed"),
            Ok(resp) => warn!(session = %self.url, status = %resp.status(), "Deleting browser session failed"),
            Err(e) => warn!(session = %self.url, error = %e, "Deleting browser session failed"),
        }
    }
}

async fn send_command(http: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, FetchError> {
    let mut req = http.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await?;
    let status = resp.status();
    let payload: Value = resp
        .json()
        .await
        .map_err(|e| FetchError::Transport(format!("{url} returned {status} with unreadable body: {e}")))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    Err(classify_driver_error(code, message, url))
}

fn element_ref(value: &Value) -> Option<ElementRef> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get("ELEMENT"))
        .and_then(Value::as_str)
        .map(|id| ElementRef(id.to_string()))
}

/// Map a W3C WebDriver error code onto the fetch error taxonomy.
pub fn classify_driver_error(code: &str, message: &str, url: &str) -> FetchError {
    let detail = if message.is_empty() {
        code.to_string()
    } else {
        format!("{code}: {message}")
    };
    match code {
        "no such element" | "stale element reference" => FetchError::not_found(url, detail),
        "timeout" | "script timeout" => FetchError::Timeout(detail),
        "session not created" | "invalid session id" | "unknown error" | "disconnected" => {
            FetchError::Transport(detail)
        }
        _ => FetchError::Rejected(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_driver_error() {
        let u = "http://localhost:9515/session/abc/element";
        assert!(matches!(
            classify_driver_error("no such element", "xpath", u),
            FetchError::NotFound { .. }
        ));
        assert!(classify_driver_error("timeout", "", u).is_transient());
        assert!(classify_driver_error("session not created", "chrome crashed", u).is_transient());
        assert!(matches!(
            classify_driver_error("invalid selector", "bad xpath", u),
            FetchError::Rejected(_)
        ));
    }

    #[test]
    fn test_element_ref_parsing() {
        let w3c = json!({ ELEMENT_KEY: "el-1" });
        assert_eq!(element_ref(&w3c), Some(ElementRef("el-1".into())));
        let legacy = json!({ "ELEMENT": "el-2" });
        assert_eq!(element_ref(&legacy), Some(ElementRef("el-2".into())));
        assert_eq!(element_ref(&json!(null)), None);
    }

    #[test]
    fn test_capabilities_per_browser() {
        let chrome = BrowserKind::Chrome.capabilities("UA");
        assert_eq!(chrome["browserName"], "chrome");
        let args = chrome["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));
        assert!(args.iter().any(|a| a == "--user-agent=UA"));

        let firefox = BrowserKind::Firefox.capabilities("UA");
        assert_eq!(firefox["moz:firefoxOptions"]["prefs"]["general.useragent.override"], "UA");

        assert_eq!(BrowserKind::Edge.capabilities("UA")["browserName"], "MicrosoftEdge");
    }

    #[test]
    fn test_locator_strategy() {
        assert_eq!(Locator::XPath("//a".into()).strategy(), ("xpath", "//a"));
        assert_eq!(Locator::Css("a.x".into()).strategy(), ("css selector", "a.x"));
    }
}
