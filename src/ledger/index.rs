//! SQLite mirror of the JSONL ledger. An index, never the source of truth.

use rusqlite::{params, Connection};
use std::path::Path;

use super::entry::LedgerEntry;
use crate::error::Result;

pub struct LedgerIndex {
    conn: Connection,
}

impl LedgerIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let mut index = Self { conn: Connection::open(path)? };
        index.init()?;
        Ok(index)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                timestamp REAL NOT NULL,
                observer TEXT NOT NULL,
                session_id TEXT,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                coherence REAL NOT NULL,
                c_total REAL NOT NULL,
                line TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_ts ON ledger_entries(timestamp);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn insert(&mut self, entry: &LedgerEntry, line: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO ledger_entries
             (id, timestamp, observer, session_id, status, kind, coherence, c_total, line)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.timestamp,
                entry.observer,
                entry.session_id,
                entry.status.as_str(),
                entry.kind.as_str(),
                entry.tensor.coherence,
                entry.c_total,
                line
            ],
        )?;
        Ok(())
    }

    /// Mirror entries that the JSONL file has but the index does not.
    pub fn backfill(&mut self, entries: &[LedgerEntry]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut added = 0;
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            added += tx.execute(
                "INSERT OR IGNORE INTO ledger_entries
                 (id, timestamp, observer, session_id, status, kind, coherence, c_total, line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id,
                    entry.timestamp,
                    entry.observer,
                    entry.session_id,
                    entry.status.as_str(),
                    entry.kind.as_str(),
                    entry.tensor.coherence,
                    entry.c_total,
                    line
                ],
            )?;
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
