use super::DeliverySink;
use crate::error::DeliveryError;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use tracing::info;

/// Dry-run sink: logs every message and reports success.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn send(&self, destination: &str, text: &str) -> Result<(), DeliveryError> {
        info!(%destination, text = %truncate_for_log(text, 500), "Dry run: message not sent");
        Ok(())
    }
}
