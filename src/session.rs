//! Bounded-retry acquisition of external resources with guaranteed release.
//!
//! Fetching a headline needs something external first: an HTTP response or a
//! live browser automation session. Both fail intermittently. This module
//! wraps their construction in a fixed-delay retry loop and, for resources
//! that hold remote state (browser sessions), hands them out as a [`Lease`]
//! that is released exactly once on every exit path.
//!
//! # Retry Strategy
//!
//! - Up to `max_attempts` constructions (at least one)
//! - Fixed `retry_delay` between attempts, no backoff growth
//! - Only failures classified as [`Transient`] are retried; anything else is
//!   returned immediately as [`SessionError::Fatal`]
//! - [`ResourceSession::scoped`] also retries transient failures of the work
//!   done with the resource, each time with a fresh one
//!
//! # Release
//!
//! [`ResourceSession::scoped`] releases the resource after the body finishes,
//! whether it succeeded or failed. If the whole future is dropped instead
//! (a per-source timeout firing mid-fetch), the [`Lease`] drop guard spawns
//! the release onto the runtime.

use crate::error::{SessionError, Transient};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// How many times to try constructing a resource and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// A policy with at least one attempt.
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// An external resource that must be torn down explicitly.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Tear down the resource. Called exactly once per handle.
    async fn release(self);
}

/// A leased resource. Derefs to the resource; releases it on drop if the
/// holder never called [`Lease::release`].
pub struct Lease<R: Resource> {
    inner: Option<R>,
    label: String,
}

impl<R: Resource> Lease<R> {
    pub fn new(resource: R, label: &str) -> Self {
        Self {
            inner: Some(resource),
            label: label.to_string(),
        }
    }

    /// Take the resource back out without releasing it.
    pub fn into_inner(mut self) -> R {
        match self.inner.take() {
            Some(resource) => resource,
            None => unreachable!("lease used after release"),
        }
    }

    /// Release the resource now and wait for teardown to finish.
    pub async fn release(mut self) {
        if let Some(resource) = self.inner.take() {
            debug!(resource = %self.label, "Releasing resource");
            resource.release().await;
        }
    }
}

impl<R: Resource> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match self.inner.as_ref() {
            Some(resource) => resource,
            // `release` consumes the lease, so a live lease always holds one.
            None => unreachable!("lease used after release"),
        }
    }
}

impl<R: Resource> Drop for Lease<R> {
    fn drop(&mut self) {
        let Some(resource) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(resource = %self.label, "Lease dropped before release; releasing in background");
                handle.spawn(resource.release());
            }
            Err(_) => {
                error!(resource = %self.label, "Lease dropped outside a runtime; resource leaked");
            }
        }
    }
}

/// Acquires resources under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct ResourceSession {
    policy: RetryPolicy,
}

impl ResourceSession {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Construct a value with `make`, retrying transient failures.
    ///
    /// # Arguments
    ///
    /// * `label` - What is being acquired, for logs
    /// * `make` - Builds one attempt; must clean up after itself if it fails
    ///   halfway through construction
    ///
    /// # Returns
    ///
    /// The constructed value, [`SessionError::Unavailable`] once
    /// `max_attempts` transient failures have happened, or
    /// [`SessionError::Fatal`] on the first non-transient failure.
    #[instrument(level = "debug", skip_all, fields(resource = %label))]
    pub async fn acquire<R, E, F, Fut>(&self, label: &str, mut make: F) -> Result<R, SessionError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Transient + fmt::Display + fmt::Debug,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match make().await {
                Ok(resource) => {
                    if attempt > 1 {
                        info!(
                            attempt,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            "Acquired after retry"
                        );
                    }
                    return Ok(resource);
                }
                Err(e) if !e.is_transient() => {
                    error!(attempt, error = %e, "Acquisition failed with non-transient error");
                    return Err(SessionError::Fatal(e));
                }
                Err(e) => {
                    if attempt >= self.policy.max_attempts {
                        error!(
                            attempt,
                            max = self.policy.max_attempts,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "Acquisition exhausted retries"
                        );
                        return Err(SessionError::Unavailable { attempts: attempt, last: e });
                    }
                    warn!(
                        attempt,
                        max = self.policy.max_attempts,
                        delay = ?self.policy.retry_delay,
                        error = %e,
                        "Acquisition attempt failed; retrying"
                    );
                    sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    /// Acquire a resource, run `body` against it, then release it.
    ///
    /// Acquisition and body share one retry budget: a transient failure in
    /// either releases the resource, waits `retry_delay` and starts over with
    /// a fresh one. Release happens exactly once per acquired resource whether
    /// `body` succeeds, fails, or the returned future is dropped mid-flight.
    #[instrument(level = "debug", skip_all, fields(resource = %label))]
    pub async fn scoped<R, T, E, F, Fut, B>(&self, label: &str, mut make: F, mut body: B) -> Result<T, E>
    where
        R: Resource,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Transient + fmt::Display + fmt::Debug + From<SessionError<E>>,
        B: for<'a> FnMut(&'a R) -> BoxFuture<'a, Result<T, E>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match make().await {
                Ok(resource) => {
                    let lease = Lease::new(resource, label);
                    let result = body(&*lease).await;
                    lease.release().await;
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            attempt,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.policy.max_attempts => {
                    error!(
                        attempt,
                        max = self.policy.max_attempts,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        error = %e,
                        "Scoped run exhausted retries"
                    );
                    return Err(SessionError::Unavailable { attempts: attempt, last: e }.into());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max = self.policy.max_attempts,
                        delay = ?self.policy.retry_delay,
                        error = %e,
                        "Scoped run failed; retrying with a fresh resource"
                    );
                    sleep(self.policy.retry_delay).await;
                }
            }
        }
    }
}
