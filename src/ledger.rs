//! Transaction and balance ledger on top of SQLite.
//!
//! All access goes through one connection behind a mutex, so ledger writes
//! are globally serialized. Each write runs inside a SQLite transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::{
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio::task;

use crate::aggregator;
use crate::error::LedgerError;
use crate::models::{BalanceRecord, Ingestion, PaymentStatus, TotalDrift, TransactionRecord};

#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut db = conn.lock().map_err(|_| LedgerError::Poisoned)?;
            f(&mut db)
        })
        .await?
    }

    /// Store a transfer unless its hash is already known, and add its amount
    /// to the sender's running total. Both writes commit together.
    pub async fn record_transfer(&self, record: TransactionRecord) -> Result<Ingestion, LedgerError> {
        self.with_conn(move |db| insert_transfer(db, &record)).await
    }

    pub async fn transaction(&self, tx_hash: &str) -> Result<Option<TransactionRecord>, LedgerError> {
        let tx_hash = tx_hash.to_lowercase();
        self.with_conn(move |db| get_transaction(db, &tx_hash)).await
    }

    /// Balance records for an address; empty when the address is unknown.
    pub async fn balances_for(&self, address: &str) -> Result<Vec<BalanceRecord>, LedgerError> {
        let address = address.to_lowercase();
        self.with_conn(move |db| {
            query_balances(
                db,
                "SELECT address, total_amount, status, payout_tx_hash, paid_at, updated_at
                 FROM balances WHERE address = ?1",
                params![address],
            )
        })
        .await
    }

    /// Unpaid balances whose total is at least `threshold`, ordered by address.
    pub async fn eligible_for_reward(&self, threshold: Decimal) -> Result<Vec<BalanceRecord>, LedgerError> {
        let unpaid = self
            .with_conn(|db| {
                query_balances(
                    db,
                    "SELECT address, total_amount, status, payout_tx_hash, paid_at, updated_at
                     FROM balances WHERE status = 'Unpaid' ORDER BY address",
                    [],
                )
            })
            .await?;

        // totals are stored as text, so the numeric filter happens here
        Ok(unpaid
            .into_iter()
            .filter(|b| b.total_amount >= threshold)
            .collect())
    }

    /// Move an address from Unpaid to Paid. Returns `false` when it was not
    /// Unpaid (already paid, or unknown).
    pub async fn mark_paid(&self, address: &str, payout_tx_hash: &str) -> Result<bool, LedgerError> {
        let address = address.to_lowercase();
        let payout_tx_hash = payout_tx_hash.to_string();
        self.with_conn(move |db| {
            let now = Utc::now().to_rfc3339();
            let changed = db.execute(
                "UPDATE balances
                 SET status = 'Paid', payout_tx_hash = ?2, paid_at = ?3, updated_at = ?3
                 WHERE address = ?1 AND status = 'Unpaid'",
                params![address, payout_tx_hash, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Addresses whose running total disagrees with their transactions.
    pub async fn audit_totals(&self) -> Result<Vec<TotalDrift>, LedgerError> {
        self.with_conn(|db| aggregator::find_drift(db)).await
    }

    pub async fn last_processed_block(&self) -> Result<Option<u64>, LedgerError> {
        self.with_conn(|db| {
            let block: Option<i64> = db
                .query_row("SELECT last_block FROM cursor WHERE id = 1", [], |r| r.get(0))
                .optional()?;
            Ok(block.map(|b| b as u64))
        })
        .await
    }

    pub async fn set_last_processed_block(&self, block: u64) -> Result<(), LedgerError> {
        self.with_conn(move |db| {
            db.execute(
                "INSERT INTO cursor (id, last_block, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                     last_block = excluded.last_block,
                     updated_at = excluded.updated_at",
                params![block as i64, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

fn insert_transfer(conn: &mut Connection, rec: &TransactionRecord) -> Result<Ingestion, LedgerError> {
    let tx = conn.transaction()?;

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO transactions
            (tx_hash, from_address, to_address, amount, block_number, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            rec.tx_hash,
            rec.from_address,
            rec.to_address,
            rec.amount.to_string(),
            rec.block_number.map(|b| b as i64),
            rec.recorded_at.to_rfc3339(),
        ],
    )?;
    if inserted == 0 {
        // dropping `tx` rolls back, nothing was written anyway
        return Ok(Ingestion::Duplicate);
    }

    let current: Option<String> = tx
        .query_row(
            "SELECT total_amount FROM balances WHERE address = ?1",
            params![rec.from_address],
            |r| r.get(0),
        )
        .optional()?;

    let total = match current {
        Some(stored) => parse_amount(&stored)?
            .checked_add(rec.amount)
            .ok_or_else(|| LedgerError::Overflow {
                address: rec.from_address.clone(),
            })?,
        None => rec.amount,
    };

    tx.execute(
        "INSERT INTO balances (address, total_amount, status, updated_at)
         VALUES (?1, ?2, 'Unpaid', ?3)
         ON CONFLICT(address) DO UPDATE SET
             total_amount = excluded.total_amount,
             updated_at   = excluded.updated_at",
        params![rec.from_address, total.to_string(), Utc::now().to_rfc3339()],
    )?;

    tx.commit()?;
    Ok(Ingestion::Recorded { total })
}

fn get_transaction(conn: &Connection, tx_hash: &str) -> Result<Option<TransactionRecord>, LedgerError> {
    let row = conn
        .query_row(
            "SELECT tx_hash, from_address, to_address, amount, block_number, recorded_at
             FROM transactions WHERE tx_hash = ?1",
            params![tx_hash],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<i64>>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    row.map(|(tx_hash, from_address, to_address, amount, block_number, recorded_at)| {
        Ok(TransactionRecord {
            tx_hash,
            from_address,
            to_address,
            amount: parse_amount(&amount)?,
            block_number: block_number.map(|b| b as u64),
            recorded_at: parse_timestamp(&recorded_at)?,
        })
    })
    .transpose()
}

type BalanceRow = (String, String, String, Option<String>, Option<String>, String);

fn query_balances<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<BalanceRecord>, LedgerError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |r| -> rusqlite::Result<BalanceRow> {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(balance_from_row).collect()
}

fn balance_from_row(row: BalanceRow) -> Result<BalanceRecord, LedgerError> {
    let (address, total, status, payout_tx_hash, paid_at, updated_at) = row;
    Ok(BalanceRecord {
        address,
        total_amount: parse_amount(&total)?,
        status: PaymentStatus::from_str(&status)?,
        payout_tx_hash,
        paid_at: paid_at.as_deref().map(parse_timestamp).transpose()?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

pub(crate) fn parse_amount(value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value).map_err(|source| LedgerError::CorruptAmount {
        value: value.to_string(),
        source,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| LedgerError::CorruptTimestamp(value.to_string()))
}
