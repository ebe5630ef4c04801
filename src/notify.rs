//! "Transfer observed" notifications.
//!
//! Delivery is fire-and-forget: failures are logged and never reach the
//! ledger path.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::TransactionRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferNotice {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
}

impl From<&TransactionRecord> for TransferNotice {
    fn from(rec: &TransactionRecord) -> Self {
        Self {
            tx_hash: rec.tx_hash.clone(),
            from: rec.from_address.clone(),
            to: rec.to_address.clone(),
            amount: rec.amount,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &TransferNotice) -> Result<()>;
}

/// Writes notices to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &TransferNotice) -> Result<()> {
        info!(
            tx_hash = %notice.tx_hash,
            to = %notice.to,
            amount = %notice.amount,
            "Transfer observed"
        );
        Ok(())
    }
}

/// POSTs each notice as JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &TransferNotice) -> Result<()> {
        let resp = self.client.post(&self.url).json(notice).send().await?;
        if !resp.status().is_success() {
            return Err(eyre!("webhook responded with HTTP {}", resp.status()));
        }
        Ok(())
    }
}

/// Send `notice` in the background. The returned handle is only useful to
/// tests; callers normally drop it.
pub fn dispatch(notifier: Arc<dyn Notifier>, notice: TransferNotice) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notice).await {
            warn!(tx_hash = %notice.tx_hash, "Notification failed: {:?}", e);
        }
    })
}
