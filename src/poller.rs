//! The polling loop: fetch, dedup, enqueue, deliver, commit.
//!
//! One background task per process runs cycles on a fixed period. Control
//! calls ([`Poller::start`], [`Poller::request_stop`], [`Poller::status`])
//! come from a different task and only touch the shared session state under
//! a lock, so every status read is a consistent snapshot.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start--> Starting --first cycle--> Running
//!   ^                 |                        |
//!   +------stop-------+-----------stop---------+
//! ```
//!
//! Stopping flips a `watch` flag the task checks at the top of every cycle
//! and while sleeping, so the loop exits within one in-flight step.
//!
//! # Per-source Cycle
//!
//! 1. Fetch the latest item under the fetch timeout; failures are logged and
//!    the source is skipped until the next cycle
//! 2. If the dedup store calls the item new, append it to the source queue
//! 3. Deliver queued items oldest first; on success remove the head and
//!    commit its id, on failure stop and leave the rest pending
//!
//! Sources run concurrently within a cycle; sends are serialized.

use crate::delivery::DeliverySink;
use crate::models::{Item, SourceInfo};
use crate::queue::PendingQueue;
use crate::sources::NewsSource;
use crate::store::DedupStore;
use crate::utils::format_duration;
use chrono::{Local, TimeDelta};
use futures::future::join_all;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

/// Settings for the polling loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between the starts of two cycles.
    pub period: Duration,
    /// Budget for one source's fetch, retries included.
    pub fetch_timeout: Duration,
    /// Where the sink sends messages (a chat id).
    pub destination: String,
    /// Fetch and include the article body in each message.
    pub include_body: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Task scheduled, first cycle not begun.
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    /// The first cycle begins after `delay`.
    Started { delay: Duration },
}

/// Consistent snapshot of the loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    /// Time left before the first cycle, while starting.
    pub starts_in: Option<Duration>,
    /// Time since the first cycle was due, once it is.
    pub running_for: Option<Duration>,
}

/// Counters for one cycle across all sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub enqueued: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
    pub fetch_errors: usize,
}

impl AddAssign for CycleReport {
    fn add_assign(&mut self, other: Self) {
        self.fetched += other.fetched;
        self.enqueued += other.enqueued;
        self.delivered += other.delivered;
        self.failed_deliveries += other.failed_deliveries;
        self.fetch_errors += other.fetch_errors;
    }
}

/// How long a fresh start must wait so two cycles never begin less than one
/// period apart.
pub fn restart_delay(period: Duration, since_last_cycle: Option<Duration>) -> Duration {
    match since_last_cycle {
        Some(elapsed) if elapsed < period => period - elapsed,
        _ => Duration::ZERO,
    }
}

struct SourceSlot {
    source: Arc<dyn NewsSource>,
    queue: tokio::sync::Mutex<PendingQueue>,
}

struct Session {
    phase: Phase,
    /// When the first cycle of the current run is due.
    scheduled_at: Option<Instant>,
    last_cycle_at: Option<Instant>,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    config: PollerConfig,
    sources: Vec<SourceSlot>,
    store: DedupStore,
    sink: Arc<dyn DeliverySink>,
    send_lock: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
}

/// Handle to the polling loop; cheap to clone.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        sources: Vec<Arc<dyn NewsSource>>,
        store: DedupStore,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| SourceSlot {
                source,
                queue: tokio::sync::Mutex::new(PendingQueue::new()),
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                config,
                sources,
                store,
                sink,
                send_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(Session {
                    phase: Phase::Idle,
                    scheduled_at: None,
                    last_cycle_at: None,
                    cancel: None,
                    task: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.inner.sources.iter().map(|slot| slot.source.info()).collect()
    }

    /// Schedule the background loop.
    ///
    /// If the previous run's last cycle began less than one period ago, the
    /// first cycle is delayed by the remainder. A task still finishing its
    /// in-flight step from an earlier run is awaited before the new one
    /// starts its first cycle.
    pub fn start(&self) -> StartOutcome {
        let mut session = self.inner.lock_session();
        if session.phase != Phase::Idle {
            return StartOutcome::AlreadyRunning;
        }

        let now = Instant::now();
        let delay = restart_delay(
            self.inner.config.period,
            session.last_cycle_at.map(|t| now.saturating_duration_since(t)),
        );
        let (tx, rx) = watch::channel(false);
        session.generation += 1;
        session.phase = Phase::Starting;
        session.scheduled_at = Some(now + delay);
        session.cancel = Some(tx);

        let previous = session.task.take();
        let generation = session.generation;
        let inner = self.inner.clone();
        session.task = Some(tokio::spawn(run_loop(inner, generation, delay, previous, rx)));

        let first_cycle_at = Local::now() + TimeDelta::from_std(delay).unwrap_or_default();
        info!(
            generation,
            delay = %format_duration(delay),
            first_cycle_at = %first_cycle_at.format("%Y-%m-%d %H:%M:%S"),
            "Polling scheduled"
        );
        StartOutcome::Started { delay }
    }

    /// Ask the loop to stop without waiting for it.
    ///
    /// # Returns
    ///
    /// `false` if the loop was not running.
    pub fn request_stop(&self) -> bool {
        let mut session = self.inner.lock_session();
        if session.phase == Phase::Idle {
            return false;
        }
        if let Some(cancel) = &session.cancel {
            cancel.send_replace(true);
        }
        session.phase = Phase::Idle;
        session.scheduled_at = None;
        info!(generation = session.generation, "Polling stop requested");
        true
    }

    /// Stop the loop and wait for the background task to exit.
    pub async fn stop_and_join(&self) -> bool {
        let was_running = self.request_stop();
        let task = self.inner.lock_session().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Polling task ended abnormally");
            }
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_session().phase != Phase::Idle
    }

    pub fn status(&self) -> Status {
        let session = self.inner.lock_session();
        let now = Instant::now();
        let (starts_in, running_for) = match (session.phase, session.scheduled_at) {
            (Phase::Idle, _) | (_, None) => (None, None),
            (_, Some(at)) if at > now => (Some(at - now), None),
            (_, Some(at)) => (None, Some(now - at)),
        };
        Status {
            phase: session.phase,
            starts_in,
            running_for,
        }
    }

    /// Run one cycle over every source.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle().await
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    generation: u64,
    delay: Duration,
    previous: Option<JoinHandle<()>>,
    mut cancel: watch::Receiver<bool>,
) {
    if let Some(previous) = previous {
        debug!("Waiting for the previous polling task to finish");
        let _ = previous.await;
    }
    if !delay.is_zero() && sleep_or_cancel(&mut cancel, delay).await {
        info!(generation, "Polling cancelled before the first cycle");
        return;
    }

    loop {
        if *cancel.borrow() {
            break;
        }
        inner.mark_cycle_start(generation);
        let report = inner.run_cycle().await;
        info!(
            generation,
            fetched = report.fetched,
            enqueued = report.enqueued,
            delivered = report.delivered,
            failed_deliveries = report.failed_deliveries,
            fetch_errors = report.fetch_errors,
            "Cycle complete"
        );
        if sleep_or_cancel(&mut cancel, inner.config.period).await {
            break;
        }
    }
    info!(generation, "Polling loop exited");
}

/// Sleep for `duration` unless cancelled first.
///
/// # Returns
///
/// `true` if the loop should exit.
async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *cancel.borrow() {
        return true;
    }
    let sleeper = sleep(duration);
    tokio::pin!(sleeper);
    loop {
        tokio::select! {
            _ = &mut sleeper => return *cancel.borrow(),
            changed = cancel.changed() => {
                // A dropped sender means the run was replaced.
                if changed.is_err() || *cancel.borrow() {
                    return true;
                }
            }
        }
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mark_cycle_start(&self, generation: u64) {
        let mut session = self.lock_session();
        session.last_cycle_at = Some(Instant::now());
        if session.generation == generation && session.phase == Phase::Starting {
            session.phase = Phase::Running;
        }
    }

    #[instrument(level = "info", skip_all, fields(sources = self.sources.len()))]
    async fn run_cycle(&self) -> CycleReport {
        let reports = join_all(self.sources.iter().map(|slot| self.poll_source(slot))).await;
        let mut total = CycleReport::default();
        for report in reports {
            total += report;
        }
        total
    }

    #[instrument(level = "info", skip_all, fields(source = %slot.source.name()))]
    async fn poll_source(&self, slot: &SourceSlot) -> CycleReport {
        let mut report = CycleReport::default();
        let name = slot.source.name();

        let fetched = match timeout(self.config.fetch_timeout, slot.source.fetch_latest()).await {
            Ok(Ok(item)) => item,
            Ok(Err(e)) => {
                warn!(error = %e, "Fetch failed; skipping source this cycle");
                report.fetch_errors += 1;
                None
            }
            Err(_) => {
                warn!(timeout = ?self.config.fetch_timeout, "Fetch timed out; skipping source this cycle");
                report.fetch_errors += 1;
                None
            }
        };

        let mut queue = slot.queue.lock().await;
        if let Some(item) = fetched {
            report.fetched += 1;
            match self.store.is_new(name, &item.id, &queue).await {
                Ok(true) => {
                    info!(item = %item, "New item");
                    if queue.enqueue(item) {
                        report.enqueued += 1;
                    }
                }
                Ok(false) => debug!(id = %item.id, "Item already seen"),
                Err(e) => error!(error = %e, "Cannot read last announced id; not enqueuing"),
            }
        }

        self.drain(slot, &mut queue, &mut report).await;
        report
    }

    /// Deliver pending items oldest first until the queue is empty or a send
    /// fails.
    async fn drain(&self, slot: &SourceSlot, queue: &mut PendingQueue, report: &mut CycleReport) {
        let name = slot.source.name();
        while let Some(item) = queue.peek_oldest().cloned() {
            let body = if self.config.include_body {
                self.body_for(slot, &item).await
            } else {
                None
            };
            let text = item.message(body.as_deref());

            let sent = {
                let _guard = self.send_lock.lock().await;
                self.sink.send(&self.config.destination, &text).await
            };
            if let Err(e) = sent {
                warn!(id = %item.id, retryable = e.is_retryable(), error = %e, "Delivery failed; item stays pending");
                report.failed_deliveries += 1;
                break;
            }

            if let Err(e) = queue.commit_oldest() {
                error!(error = %e, "Queue emptied during delivery");
                break;
            }
            report.delivered += 1;
            if let Err(e) = self.store.commit(name, &item.id).await {
                error!(id = %item.id, error = %e, "Delivered but not persisted; may repeat after restart");
            }
            info!(id = %item.id, pending = queue.len(), "Item delivered");
        }
        if !queue.is_empty() {
            debug!(pending = queue.len(), "Items left for the next cycle");
        }
    }

    /// Article body for `item`, or `None` if it cannot be had.
    async fn body_for(&self, slot: &SourceSlot, item: &Item) -> Option<String> {
        match timeout(self.config.fetch_timeout, slot.source.fetch_body(&item.link)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!(id = %item.id, error = %e, "Body unavailable; posting headline only");
                None
            }
            Err(_) => {
                warn!(id = %item.id, "Body fetch timed out; posting headline only");
                None
            }
        }
    }
}
