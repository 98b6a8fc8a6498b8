//! Indexed telemetry records backed by SQLite.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::ledger::{LedgerEntry, TrendSummary};
use crate::tensor::{pstdev, LedgerTensor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub count: usize,
    pub psi_mean: f64,
    pub kappa_mean: f64,
    pub coherence_mean: f64,
    pub stability_mean: f64,
    pub phi_mean: f64,
}

/// Φ statistics over recent records that carry awareness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhiTrend {
    pub count: usize,
    pub phi_mean: f64,
    pub phi_std: f64,
    pub psi_mean: f64,
    pub kappa_mean: f64,
    pub coherence_mean: f64,
    /// max(0, 1 − Φ_std).
    pub stability_index: f64,
    pub last_timestamp: f64,
}

/// How closely Φ tracks ψ over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResonanceCoupling {
    pub count: usize,
    pub phi_mean: f64,
    pub psi_mean: f64,
    /// Pearson r between Φ and ψ; 0 when either is constant.
    pub correlation: f64,
    /// Mean |Φ − ψ|.
    pub phase_diff: f64,
    /// clamp((1 − phase_diff) · |r|, 0, 1).
    pub resonance_index: f64,
    pub timestamp: f64,
}

/// Fewest samples a coupling is computed from.
pub const MIN_COUPLING_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy)]
struct PhiSample {
    timestamp: f64,
    phi: f64,
    psi: f64,
    kappa: f64,
    coherence: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub struct TelemetryDb {
    conn: Connection,
}

impl TelemetryDb {
    /// `":memory:"` opens a private in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        let mut db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS telemetry (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp REAL NOT NULL,
                observer TEXT NOT NULL,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                psi REAL NOT NULL,
                kappa REAL NOT NULL,
                t REAL NOT NULL,
                coherence REAL NOT NULL,
                gradient REAL NOT NULL,
                stability REAL NOT NULL,
                phi REAL,
                c_total REAL NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_telemetry_ts ON telemetry(timestamp);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Idempotent on `id`. Returns whether a row was added.
    pub fn ingest(&mut self, entry: &LedgerEntry, session_id: &str) -> Result<bool> {
        let record = serde_json::to_string(entry)?;
        let session = entry.session_id.as_deref().unwrap_or(session_id);
        let added = self.conn.execute(
            "INSERT OR IGNORE INTO telemetry
             (id, session_id, timestamp, observer, status, kind, psi, kappa, t, coherence,
              gradient, stability, phi, c_total, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry.id,
                session,
                entry.timestamp,
                entry.observer,
                entry.status.as_str(),
                entry.kind.as_str(),
                entry.tensor.psi,
                entry.tensor.kappa,
                entry.tensor.t,
                entry.tensor.coherence,
                entry.tensor.gradient,
                entry.tensor.stability,
                entry.phi(),
                entry.c_total,
                record
            ],
        )?;
        Ok(added > 0)
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<String> {
        row.get(0)
    }

    fn collect(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, Self::record_from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    /// Records with `t_start <= timestamp <= t_end`, oldest first.
    pub fn query_range(&self, t_start: f64, t_end: f64) -> Result<Vec<LedgerEntry>> {
        self.collect(
            "SELECT record FROM telemetry WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC, rowid ASC",
            params![t_start, t_end],
        )
    }

    /// The newest `n` records, oldest first.
    pub fn latest_values(&self, n: usize) -> Result<Vec<LedgerEntry>> {
        let mut out = self.collect(
            "SELECT record FROM telemetry ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
            params![n as i64],
        )?;
        out.reverse();
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<LedgerEntry>> {
        self.collect("SELECT record FROM telemetry ORDER BY timestamp ASC, rowid ASC", [])
    }

    pub fn summary(&self) -> Result<TelemetrySummary> {
        let row = self
            .conn
            .query_row(
                "SELECT COUNT(*), AVG(psi), AVG(kappa), AVG(coherence), AVG(stability), AVG(phi)
                 FROM telemetry",
                [],
                |row| {
                    Ok(TelemetrySummary {
                        count: row.get::<_, i64>(0)? as usize,
                        psi_mean: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                        kappa_mean: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                        coherence_mean: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        stability_mean: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                        phi_mean: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    /// `(timestamp, C)` for the newest `n` records, oldest first.
    pub fn coherence_trend(&self, n: usize) -> Result<Vec<(f64, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, coherence FROM telemetry ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for pair in rows {
            out.push(pair?);
        }
        out.reverse();
        Ok(out)
    }

    /// Trend statistics over the newest `n` records.
    pub fn trend(&self, n: usize) -> Result<TrendSummary> {
        let tensors: Vec<LedgerTensor> = self.latest_values(n)?.iter().map(|e| e.tensor).collect();
        Ok(TrendSummary::from_tensors(&tensors))
    }

    /// Newest `n` records with a Φ value, oldest first.
    fn phi_samples(&self, n: usize) -> Result<Vec<PhiSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, phi, psi, kappa, coherence FROM telemetry
             WHERE phi IS NOT NULL
             ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok(PhiSample {
                timestamp: row.get(0)?,
                phi: row.get(1)?,
                psi: row.get(2)?,
                kappa: row.get(3)?,
                coherence: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for sample in rows {
            out.push(sample?);
        }
        out.reverse();
        Ok(out)
    }

    /// Φ mean/std and the derived stability over the newest `n` samples.
    pub fn phi_trend(&self, n: usize) -> Result<PhiTrend> {
        let samples = self.phi_samples(n)?;
        let Some(last) = samples.last() else {
            return Ok(PhiTrend::default());
        };
        let phi: Vec<f64> = samples.iter().map(|s| s.phi).collect();
        let psi: Vec<f64> = samples.iter().map(|s| s.psi).collect();
        let kappa: Vec<f64> = samples.iter().map(|s| s.kappa).collect();
        let coherence: Vec<f64> = samples.iter().map(|s| s.coherence).collect();
        let phi_std = pstdev(&phi);
        Ok(PhiTrend {
            count: samples.len(),
            phi_mean: mean(&phi),
            phi_std,
            psi_mean: mean(&psi),
            kappa_mean: mean(&kappa),
            coherence_mean: mean(&coherence),
            stability_index: (1.0 - phi_std).max(0.0),
            last_timestamp: last.timestamp,
        })
    }

    /// Φ–ψ coupling over the newest `window` samples. Empty (count 0) with
    /// fewer than [`MIN_COUPLING_SAMPLES`].
    pub fn resonance_coupling(&self, window: usize) -> Result<ResonanceCoupling> {
        let samples = self.phi_samples(window)?;
        if samples.len() < MIN_COUPLING_SAMPLES {
            return Ok(ResonanceCoupling::default());
        }
        let phi: Vec<f64> = samples.iter().map(|s| s.phi).collect();
        let psi: Vec<f64> = samples.iter().map(|s| s.psi).collect();
        let (phi_mean, psi_mean) = (mean(&phi), mean(&psi));

        let mut cov = 0.0;
        let mut var_phi = 0.0;
        let mut var_psi = 0.0;
        for (a, b) in phi.iter().zip(&psi) {
            cov += (a - phi_mean) * (b - psi_mean);
            var_phi += (a - phi_mean).powi(2);
            var_psi += (b - psi_mean).powi(2);
        }
        let den = (var_phi * var_psi).sqrt();
        let correlation = if den > 0.0 { cov / den } else { 0.0 };
        let phase_diff = mean(&phi.iter().zip(&psi).map(|(a, b)| (a - b).abs()).collect::<Vec<_>>());

        Ok(ResonanceCoupling {
            count: samples.len(),
            phi_mean,
            psi_mean,
            correlation,
            phase_diff,
            resonance_index: ((1.0 - phase_diff) * correlation.abs()).clamp(0.0, 1.0),
            timestamp: samples.last().map(|s| s.timestamp).unwrap_or_default(),
        })
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM telemetry", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Write every record as a JSON array, oldest first.
    pub fn export_json(&self, path: &Path) -> Result<usize> {
        let records = self.all()?;
        std::fs::write(path, serde_json::to_string_pretty(&records)?)?;
        Ok(records.len())
    }

    /// Ingest a JSON array written by `export_json` (or a ledger export).
    pub fn import_json(&mut self, path: &Path, session_id: &str) -> Result<usize> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<LedgerEntry> = serde_json::from_str(&raw)?;
        let mut added = 0;
        for record in &records {
            if self.ingest(record, session_id)? {
                added += 1;
            }
        }
        Ok(added)
    }
}
