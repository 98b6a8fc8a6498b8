//! Replay committed field states from a ledger file or a telemetry DB.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::ledger::{read_entries_strict, LedgerEntry};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::telemetry::TelemetryDb;
use crate::tensor::LedgerTensor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySource {
    Ledger(PathBuf),
    Telemetry(PathBuf),
}

impl ReplaySource {
    /// `.db`, `.sqlite` and `.sqlite3` are telemetry databases; anything
    /// else is read as a JSONL ledger.
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("db") | Some("sqlite") | Some("sqlite3") => ReplaySource::Telemetry(path.to_path_buf()),
            _ => ReplaySource::Ledger(path.to_path_buf()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ReplaySource::Ledger(p) | ReplaySource::Telemetry(p) => p,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub index: usize,
    pub entry_id: String,
    pub timestamp: f64,
    pub session_id: Option<String>,
    pub tensor: LedgerTensor,
    pub phi: Option<f64>,
}

impl ReplayFrame {
    fn from_entry(index: usize, e: &LedgerEntry) -> Self {
        Self {
            index,
            entry_id: e.id.clone(),
            timestamp: e.timestamp,
            session_id: e.session_id.clone(),
            tensor: e.tensor,
            phi: e.phi(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": "replay",
            "index": self.index,
            "entry_id": self.entry_id,
            "timestamp": self.timestamp,
            "session_id": self.session_id,
            "field_tensor": self.tensor,
            "phi": self.phi,
        })
    }
}

pub struct Replay {
    frames: Vec<ReplayFrame>,
}

impl Replay {
    pub fn load(source: &ReplaySource) -> Result<Self> {
        if !source.path().exists() {
            return Err(RuntimeError::LedgerNotFound(source.path().to_path_buf()));
        }
        let entries = match source {
            ReplaySource::Ledger(path) => read_entries_strict(path)?,
            ReplaySource::Telemetry(path) => TelemetryDb::open(&path.to_string_lossy())?.all()?,
        };
        Ok(Self::from_entries(entries))
    }

    /// Committed field commits only, stable-sorted by timestamp.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let mut commits: Vec<LedgerEntry> = entries.into_iter().filter(|e| e.is_field_commit()).collect();
        commits.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self {
            frames: commits
                .iter()
                .enumerate()
                .map(|(i, e)| ReplayFrame::from_entry(i, e))
                .collect(),
        }
    }

    pub fn frames(&self) -> &[ReplayFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Feed frames to `sink`, sleeping `speed` seconds between them.
    pub async fn run<F>(&self, speed: f64, mut sink: F) -> Result<usize>
    where
        F: FnMut(&ReplayFrame) -> Result<()>,
    {
        let pause = if speed.is_finite() && speed > 0.0 {
            Some(Duration::from_secs_f64(speed))
        } else {
            None
        };
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                if let Some(pause) = pause {
                    tokio::time::sleep(pause).await;
                }
            }
            sink(frame)?;
        }
        log(
            Level::Info,
            Domain::Telemetry,
            "replay_complete",
            obj(&[("frames", json!(self.frames.len())), ("speed", json!(speed)), ("msg", v_str("replay done"))]),
        );
        Ok(self.frames.len())
    }
}
