use eyre::Result;
use rusqlite::Connection;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
  tx_hash       TEXT PRIMARY KEY,
  from_address  TEXT NOT NULL,
  to_address    TEXT NOT NULL,
  amount        TEXT NOT NULL, -- Decimal stored as string
  block_number  INTEGER,
  recorded_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions(from_address);

CREATE TABLE IF NOT EXISTS balances (
  address         TEXT PRIMARY KEY,
  total_amount    TEXT NOT NULL, -- Decimal stored as string
  status          TEXT NOT NULL DEFAULT 'Unpaid' CHECK (status IN ('Unpaid','Paid')),
  payout_tx_hash  TEXT,
  paid_at         TEXT,
  updated_at      TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS balances_status_monotonic
BEFORE UPDATE OF status ON balances
WHEN OLD.status = 'Paid' AND NEW.status <> 'Paid'
BEGIN
  SELECT RAISE(ABORT, 'payment status cannot go back to Unpaid');
END;

CREATE TABLE IF NOT EXISTS cursor (
  id          INTEGER PRIMARY KEY CHECK (id = 1),
  last_block  INTEGER NOT NULL,
  updated_at  TEXT NOT NULL
);
"#;

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// In-memory database with the schema applied.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    run_migrations(&conn)?;
    Ok(conn)
}
