use rusqlite::Connection;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::LedgerError;
use crate::ledger::parse_amount;
use crate::models::TotalDrift;

/// Recompute every sender's total from the transactions table and compare it
/// with the incrementally maintained balance.
pub fn find_drift(conn: &Connection) -> Result<Vec<TotalDrift>, LedgerError> {
    // Sum per sender (amounts are decimal text, so summing happens in Rust)
    let mut ledger_totals: BTreeMap<String, Decimal> = BTreeMap::new();
    {
        let mut stmt = conn.prepare("SELECT from_address, amount FROM transactions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (address, amount) = row?;
            let amount = parse_amount(&amount)?;
            let entry = ledger_totals.entry(address.clone()).or_insert(Decimal::ZERO);
            *entry = entry
                .checked_add(amount)
                .ok_or(LedgerError::Overflow { address })?;
        }
    }

    let mut stored_totals: BTreeMap<String, Decimal> = BTreeMap::new();
    {
        let mut stmt = conn.prepare("SELECT address, total_amount FROM balances")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (address, total) = row?;
            stored_totals.insert(address, parse_amount(&total)?);
        }
    }

    let mut drift = Vec::new();
    let addresses: std::collections::BTreeSet<&String> =
        ledger_totals.keys().chain(stored_totals.keys()).collect();

    for address in addresses {
        let ledger_total = ledger_totals.get(address).copied().unwrap_or(Decimal::ZERO);
        let stored_total = stored_totals.get(address).copied().unwrap_or(Decimal::ZERO);

        if ledger_total != stored_total {
            warn!(
                "Total drift for {}: stored {} vs ledger {}",
                address, stored_total, ledger_total
            );
            drift.push(TotalDrift {
                address: address.clone(),
                stored_total,
                ledger_total,
            });
        }
    }

    Ok(drift)
}
