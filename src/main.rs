//! # News Relay
//!
//! Polls a set of news pages for their latest headline and relays every new
//! item exactly once to a Telegram chat.
//!
//! ## Features
//!
//! - Three source kinds: static HTML with CSS selectors, Next.js pages with
//!   an embedded `__NEXT_DATA__` blob, and script-rendered pages read through
//!   a WebDriver browser session
//! - Bounded fixed-delay retry around every external fetch, with browser
//!   sessions released on every exit path
//! - Commit-on-deliver deduplication persisted per source, so restarts never
//!   lose an item and rarely repeat one
//! - Optional article body under each headline
//! - Console control: `start`, `stop`, `status`, `sources`
//!
//! ## Usage
//!
//! ```sh
//! TELEGRAM_TOKEN=... TELEGRAM_CHAT_ID=... news_relay -c sources.yaml -s ./state
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: each source returns its newest item (`sources`)
//! 2. **Dedup**: the item is compared with the last delivered id (`store`)
//! 3. **Queueing**: new items wait in a per-source FIFO (`queue`)
//! 4. **Delivery**: the oldest pending item is sent, then committed (`poller`)

use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod control;
mod delivery;
mod error;
mod http;
mod models;
mod poller;
mod queue;
mod session;
mod sources;
mod store;
mod utils;
mod webdriver;

use cli::Cli;
use config::Config;
use control::{Command, HELP, respond};
use delivery::{DeliverySink, LogSink, TelegramSink};
use http::HttpFetcher;
use poller::{Poller, PollerConfig};
use session::ResourceSession;
use sources::Backends;
use store::{DedupStore, FileIdStore, IdStore, MemoryIdStore};
use utils::ensure_writable_dir;
use webdriver::WebDriverClient;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_relay starting up");

    let args = Cli::parse();
    debug!(
        config = %args.config,
        state_dir = %args.state_dir,
        webdriver = ?args.webdriver_url,
        dry_run = args.dry_run,
        "Parsed CLI arguments"
    );

    let config = Config::load(&args.config).await?;

    // Early check: the dedup state must be persistable before anything is sent
    if let Err(e) = ensure_writable_dir(&args.state_dir).await {
        error!(
            path = %args.state_dir,
            error = %e,
            "State directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    // ---- Fetch backends and sources ----
    let retry = config.retry_policy();
    let webdriver = match &args.webdriver_url {
        Some(url) if config.has_browser_sources() => Some(WebDriverClient::new(
            url,
            config.browser,
            &config.user_agent,
            config.fetch_timeout(),
        )?),
        Some(_) => {
            debug!("No browser sources configured; WebDriver endpoint unused");
            None
        }
        None => None,
    };
    let backends = Backends {
        http: HttpFetcher::new(&config.user_agent, config.fetch_timeout(), retry)?,
        webdriver,
        session: ResourceSession::new(retry),
    };
    let sources = config
        .sources
        .iter()
        .map(|s| sources::build(s, &backends))
        .collect::<Result<Vec<_>, _>>()?;
    info!(count = sources.len(), "Sources ready");

    // ---- Delivery ----
    let destination = args
        .telegram_chat_id
        .clone()
        .unwrap_or_else(|| "dry-run".to_string());
    let sink: Arc<dyn DeliverySink> = match (&args.telegram_token, &args.telegram_chat_id) {
        (Some(token), Some(_)) if !args.dry_run => Arc::new(TelegramSink::new(token)?),
        _ => {
            if !args.dry_run {
                warn!("TELEGRAM_TOKEN or TELEGRAM_CHAT_ID missing; logging messages instead of sending");
            }
            Arc::new(LogSink)
        }
    };

    // Dry runs must not advance the persisted ids a real run relies on
    let backend: Arc<dyn IdStore> = if args.dry_run {
        Arc::new(MemoryIdStore::default())
    } else {
        Arc::new(FileIdStore::new(&args.state_dir))
    };
    let store = DedupStore::new(backend);
    let poller = Poller::new(
        PollerConfig {
            period: config.period(),
            fetch_timeout: config.fetch_timeout(),
            destination,
            include_body: config.include_body,
        },
        sources,
        store,
        sink,
    );

    if !args.no_autostart {
        println!("{}", respond(Command::Start, &poller));
    }
    println!("{HELP}");

    // ---- Console control ----
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(cmd) => println!("{}", respond(cmd, &poller)),
                    Err(e) => println!("{e}"),
                },
                Ok(None) => {
                    info!("stdin closed; polling continues until interrupted");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Reading stdin failed");
                    break;
                }
            }
        }
    }

    poller.stop_and_join().await;

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Shutdown complete"
    );
    Ok(())
}
