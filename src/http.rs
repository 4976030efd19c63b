//! Plain HTTP page retrieval with status classification and retry.

use crate::error::FetchError;
use crate::session::{ResourceSession, RetryPolicy};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

/// Browser-like user agent; several news sites serve an empty shell to
/// obvious bots.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Shared HTTP client used by the stateless source kinds.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    session: ResourceSession,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            session: ResourceSession::new(retry),
        })
    }

    /// GET a page body, retrying transport failures and retryable statuses.
    #[instrument(level = "info", skip_all, fields(%url))]
    pub async fn get_page(&self, url: &str) -> Result<String, FetchError> {
        let html = self
            .session
            .acquire(url, || self.get_once(url))
            .await?;
        debug!(bytes = html.len(), "Fetched page");
        Ok(html)
    }

    async fn get_once(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }
        Ok(resp.text().await?)
    }
}

/// Map a non-success HTTP status to a fetch error.
///
/// Request timeouts, rate limiting and server errors are worth another try;
/// any other client error will not change on retry.
pub fn classify_status(status: StatusCode, url: &str) -> FetchError {
    let msg = format!("{url} returned {status}");
    if status == StatusCode::REQUEST_TIMEOUT {
        FetchError::Timeout(msg)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::Transport(msg)
    } else {
        FetchError::Rejected(msg)
    }
}
