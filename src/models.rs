// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A watched-token transfer extracted from a receipt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: String,
    pub to: String,
    pub amount: Decimal, // human-readable token units
}

/// One row per transaction hash that carried a qualifying transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub block_number: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(tx_hash: &str, block_number: Option<u64>, event: &TransferEvent) -> Self {
        Self {
            tx_hash: tx_hash.to_lowercase(),
            from_address: event.from.to_lowercase(),
            to_address: event.to.to_lowercase(),
            amount: event.amount,
            block_number,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "Unpaid",
            PaymentStatus::Paid => "Paid",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown payment status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unpaid" => Ok(PaymentStatus::Unpaid),
            "Paid" => Ok(PaymentStatus::Paid),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Cumulative amount sent by one address, plus its reward status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceRecord {
    pub address: String,
    pub total_amount: Decimal,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Result of the insert-if-absent ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingestion {
    /// New transaction stored; carries the sender's new running total.
    Recorded { total: Decimal },
    /// Hash already present, nothing changed.
    Duplicate,
}

/// An address whose stored total disagrees with the sum of its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalDrift {
    pub address: String,
    pub stored_total: Decimal,
    pub ledger_total: Decimal,
}
