//! Error types shared across fetching, queueing, persistence and delivery.
//!
//! Every failure a poll cycle can hit is classified here so the loop can
//! decide between "retry now", "skip this source until next cycle" and
//! "leave the item pending".

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure while fetching a headline or an article body from a source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The page loaded but the expected structural element was absent.
    #[error("{what} not found at {url}")]
    NotFound { url: String, what: String },

    /// Network or automation-driver failure. Retried.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote end did not answer in time. Retried.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The remote end answered with a definitive refusal (4xx, invalid
    /// selector, bad session arguments). Not retried.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A browser session or HTTP resource could not be acquired within the
    /// retry budget.
    #[error("resource unavailable after {attempts} attempts: {last}")]
    ResourceUnavailable { attempts: u32, last: String },
}

impl FetchError {
    pub fn not_found(url: impl Into<String>, what: impl Into<String>) -> Self {
        FetchError::NotFound {
            url: url.into(),
            what: what.into(),
        }
    }

    /// Whether the failure belongs to the transient set that the resource
    /// session retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_builder() {
            FetchError::Rejected(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Anything the resource session can retry must say whether a given failure
/// is worth another attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        FetchError::is_transient(self)
    }
}

/// Outcome of a failed resource acquisition.
#[derive(Debug, Error)]
pub enum SessionError<E>
where
    E: fmt::Display + fmt::Debug,
{
    /// Every attempt failed with a transient error.
    #[error("resource unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: E },

    /// A non-transient failure stopped the retry loop early.
    #[error("{0}")]
    Fatal(E),
}

impl From<SessionError<FetchError>> for FetchError {
    fn from(err: SessionError<FetchError>) -> Self {
        match err {
            SessionError::Unavailable { attempts, last } => FetchError::ResourceUnavailable {
                attempts,
                last: last.to_string(),
            },
            SessionError::Fatal(e) => e,
        }
    }
}

/// Misuse of the pending queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("commit called on an empty queue")]
    Empty,
}

/// Failure handing a message to the delivery channel.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Rate limiting, server errors, network trouble.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The channel refused the message itself (malformed text, bad chat id).
    #[error("delivery rejected: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        // Bot API urls carry the token.
        let err = err.without_url();
        if err.is_builder() || err.is_decode() {
            DeliveryError::Permanent(err.to_string())
        } else {
            DeliveryError::Transient(err.to_string())
        }
    }
}

/// Failure reading or writing the persisted last-announced ids.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid source key {0:?}")]
    InvalidKey(String),
}

/// Failure loading the YAML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
