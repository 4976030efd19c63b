//! Outbound channel for announced items.
//!
//! The polling loop only knows [`DeliverySink`]; which implementation it gets
//! is decided once in `main` from the command line and environment.

pub mod log;
pub mod telegram;

use crate::error::DeliveryError;
use async_trait::async_trait;

pub use log::LogSink;
pub use telegram::TelegramSink;

/// Pluggable delivery channel.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Send one message to `destination` (a chat id for Telegram).
    async fn send(&self, destination: &str, text: &str) -> Result<(), DeliveryError>;
}
