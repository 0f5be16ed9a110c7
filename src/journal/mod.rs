//! SQLite audit journal of consumer outcomes.
//!
//! One row per processed closure request. Amounts are stored as decimal
//! strings since they can exceed SQLite's 64-bit integers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::pipeline::{ClosureOutcome, ClosureRequest};

/// A journal row as read back for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub recorded_at: DateTime<Utc>,
    pub position_id: String,
    pub counterparty: String,
    pub observed_block: u64,
    pub close_amount: String,
    pub is_forced: bool,
    pub outcome: String,
    pub tx_hash: Option<String>,
    pub follow_up_amount: Option<String>,
    pub detail: Option<String>,
}

pub struct ClosureJournal {
    conn: Mutex<Connection>,
}

impl ClosureJournal {
    /// Open (or create) the journal database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open journal at {:?}", path.as_ref()))?;
        let journal = Self::from_connection(conn)?;
        info!("Closure journal initialized at {:?}", path.as_ref());
        Ok(journal)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS closures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                position_id TEXT NOT NULL,
                counterparty TEXT NOT NULL,
                observed_block INTEGER NOT NULL,
                close_amount TEXT NOT NULL,
                is_forced INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                tx_hash TEXT,
                follow_up_amount TEXT,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_closures_position ON closures(position_id, counterparty);
            CREATE INDEX IF NOT EXISTS idx_closures_outcome ON closures(outcome);
            "#,
        )
        .context("Failed to create journal schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Journal connection mutex poisoned"))
    }

    /// Record the outcome of one processed request.
    pub fn record(
        &self,
        request: &ClosureRequest,
        outcome: &ClosureOutcome,
        tx_hash: Option<&str>,
    ) -> Result<()> {
        let observed_block = i64::try_from(request.observed_block)
            .with_context(|| format!("observed block {} exceeds journal range", request.observed_block))?;

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO closures (recorded_at, position_id, counterparty, observed_block,
                                  close_amount, is_forced, outcome, tx_hash,
                                  follow_up_amount, detail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                Utc::now().to_rfc3339(),
                request.position_id.to_string(),
                request.counterparty.to_string(),
                observed_block,
                request.close_amount.to_string(),
                request.is_forced,
                outcome.kind(),
                tx_hash,
                outcome.follow_up_amount().map(|a| a.to_string()),
                outcome.detail(),
            ],
        )?;

        debug!(request = %request, outcome = outcome.kind(), "Journal entry recorded");
        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT recorded_at, position_id, counterparty, observed_block, close_amount,
                   is_forced, outcome, tx_hash, follow_up_amount, detail
            FROM closures
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                let observed_block = row.get::<_, i64>(3)?;
                Ok(JournalEntry {
                    recorded_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(0)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    position_id: row.get(1)?,
                    counterparty: row.get(2)?,
                    observed_block: u64::try_from(observed_block)
                        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, observed_block))?,
                    close_amount: row.get(4)?,
                    is_forced: row.get(5)?,
                    outcome: row.get(6)?,
                    tx_hash: row.get(7)?,
                    follow_up_amount: row.get(8)?,
                    detail: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Row count per outcome kind, most frequent first.
    pub fn outcome_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT outcome, COUNT(*) FROM closures GROUP BY outcome ORDER BY COUNT(*) DESC, outcome",
        )?;
        let counts = stmt
            .query_map([], |row| {
                let count = row.get::<_, i64>(1)?;
                let count = u64::try_from(count)
                    .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(1, count))?;
                Ok((row.get(0)?, count))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}
