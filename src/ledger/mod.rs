//! Append-only morphic ledger.
//!
//! The JSONL file is authoritative. Every record is one line written in a
//! single call; the optional SQLite index mirrors the line afterwards and
//! its failures are logged, never returned. Rollback is a new record.

pub mod entry;
pub mod index;
pub mod wal;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::clock::SharedClock;
use crate::config::LedgerConfig;
use crate::error::{Result, RuntimeError};
use crate::logging::{log, log_commit, obj, v_str, Domain, Level};
use crate::tensor::{pstdev, LedgerTensor};

pub use entry::{digest, CoherenceScores, CommitInput, EntryKind, EntryLink, EntryStatus, LedgerEntry};
pub use index::LedgerIndex;
pub use wal::LedgerLog;

/// A record built but not yet written.
#[derive(Debug, Clone)]
pub struct PreparedCommit {
    pub entry: LedgerEntry,
    pub line: String,
}

impl PreparedCommit {
    pub fn id(&self) -> &str {
        &self.entry.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: usize,
    pub psi_mean: f64,
    pub kappa_mean: f64,
    pub coherence_mean: f64,
    pub psi_std: f64,
    pub kappa_std: f64,
    pub coherence_std: f64,
    pub stability_index: f64,
}

impl TrendSummary {
    pub fn from_tensors(tensors: &[LedgerTensor]) -> Self {
        if tensors.is_empty() {
            return Self::default();
        }
        let n = tensors.len() as f64;
        let psi: Vec<f64> = tensors.iter().map(|t| t.psi).collect();
        let kappa: Vec<f64> = tensors.iter().map(|t| t.kappa).collect();
        let coherence: Vec<f64> = tensors.iter().map(|t| t.coherence).collect();
        let coherence_std = pstdev(&coherence);
        Self {
            count: tensors.len(),
            psi_mean: psi.iter().sum::<f64>() / n,
            kappa_mean: kappa.iter().sum::<f64>() / n,
            coherence_mean: coherence.iter().sum::<f64>() / n,
            psi_std: pstdev(&psi),
            kappa_std: pstdev(&kappa),
            coherence_std,
            stability_index: (1.0 - coherence_std).max(0.0),
        }
    }
}

/// Restorable commits kept in memory for repair.
const RESTORE_DEPTH: usize = 16;
const BACKFILL_BATCH: usize = 512;

/// Append-only ledger. Only a bounded tail of records stays in memory,
/// plus the newest restorable commits and the ids rollbacks superseded;
/// longer windows are read back from the file.
pub struct Ledger {
    cfg: LedgerConfig,
    session_id: String,
    log: LedgerLog,
    index: Option<LedgerIndex>,
    tail: VecDeque<LedgerEntry>,
    restorable: VecDeque<LedgerEntry>,
    superseded: HashSet<String>,
    count: usize,
    last_ts: f64,
    clock: SharedClock,
}

impl Ledger {
    /// Open (or create) the ledger at `cfg.path`, streaming existing records.
    pub fn open(cfg: &LedgerConfig, session_id: &str, clock: SharedClock) -> Result<Self> {
        let existed = cfg.path.is_file();
        let wal = LedgerLog::open(&cfg.path, cfg.fsync).map_err(RuntimeError::LedgerWrite)?;
        let index = match &cfg.index_path {
            Some(path) => Some(LedgerIndex::open(path)?),
            None => None,
        };

        let mut ledger = Self {
            cfg: cfg.clone(),
            session_id: session_id.to_string(),
            log: wal,
            index,
            tail: VecDeque::new(),
            restorable: VecDeque::new(),
            superseded: HashSet::new(),
            count: 0,
            last_ts: f64::NEG_INFINITY,
            clock,
        };
        if existed {
            ledger.load()?;
        }

        log(
            Level::Info,
            Domain::Ledger,
            "open",
            obj(&[
                ("path", v_str(&cfg.path.to_string_lossy())),
                ("entries", json!(ledger.count)),
                ("in_memory", json!(ledger.tail.len())),
                ("indexed", json!(ledger.index.is_some())),
            ]),
        );
        Ok(ledger)
    }

    fn load(&mut self) -> Result<()> {
        let path = self.cfg.path.clone();
        let mut batch: Vec<LedgerEntry> = Vec::new();
        let mut added = 0;
        LedgerLog::for_each_line(&path, |line_no, line| {
            let Some(entry) = parse_lenient(line_no, &line) else {
                return Ok(());
            };
            if let Some(index) = self.index.as_mut() {
                batch.push(entry.clone());
                if batch.len() >= BACKFILL_BATCH {
                    added += index.backfill(&batch)?;
                    batch.clear();
                }
            }
            self.remember(entry);
            Ok::<(), RuntimeError>(())
        })?;
        if let Some(index) = self.index.as_mut() {
            if !batch.is_empty() {
                added += index.backfill(&batch)?;
            }
        }
        if added > 0 {
            log(Level::Info, Domain::Ledger, "index_backfill", obj(&[("added", json!(added))]));
        }
        Ok(())
    }

    /// Track a record that is on disk.
    fn remember(&mut self, entry: LedgerEntry) {
        self.count += 1;
        self.last_ts = self.last_ts.max(entry.timestamp);
        if let Some(id) = entry.supersedes() {
            let id = id.to_string();
            self.restorable.retain(|e| e.id != id);
            self.superseded.insert(id);
        }
        if entry.is_field_commit() && entry.has_valid_tensor() && !self.superseded.contains(&entry.id) {
            self.restorable.push_back(entry.clone());
            while self.restorable.len() > RESTORE_DEPTH {
                self.restorable.pop_front();
            }
        }
        self.tail.push_back(entry);
        let cap = self.cfg.tail_entries.max(1);
        while self.tail.len() > cap {
            self.tail.pop_front();
        }
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn threshold(&self) -> f64 {
        self.cfg.sqi_threshold
    }

    /// The in-memory tail, oldest first.
    pub fn entries(&self) -> &VecDeque<LedgerEntry> {
        &self.tail
    }

    /// Records in the whole file, not just the tail.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn find(&self, id: &str) -> Option<&LedgerEntry> {
        self.tail.iter().rev().find(|e| e.id == id)
    }

    pub fn index(&self) -> Option<&LedgerIndex> {
        self.index.as_ref()
    }

    /// Build the record: id, non-decreasing timestamp, C_total, status.
    pub fn prepare(&self, input: CommitInput) -> Result<PreparedCommit> {
        let c_total = match input.scores {
            Some(scores) => scores.total(),
            None => input.tensor.coherence,
        };
        let status = input.status.unwrap_or(if c_total >= self.cfg.sqi_threshold {
            EntryStatus::Committed
        } else {
            EntryStatus::Pending
        });
        let now = self.clock.now();
        let timestamp = if now < self.last_ts { self.last_ts } else { now };

        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            observer: input.observer,
            session_id: Some(self.session_id.clone()),
            tensor: input.tensor,
            meta: input.meta,
            status,
            kind: input.kind,
            link: input.link,
            c_total,
        };
        let line = serde_json::to_string(&entry)?;
        Ok(PreparedCommit { entry, line })
    }

    /// Write a prepared record. The in-memory view only changes once the
    /// line is on disk.
    pub fn append(&mut self, prepared: PreparedCommit) -> Result<LedgerEntry> {
        let PreparedCommit { entry, line } = prepared;
        self.log.append(&line).map_err(RuntimeError::LedgerWrite)?;

        if let Some(index) = self.index.as_mut() {
            if let Err(err) = index.insert(&entry, &line) {
                log(
                    Level::Warn,
                    Domain::Ledger,
                    "index_mirror_failed",
                    obj(&[("entry_id", v_str(&entry.id)), ("error", v_str(&err.to_string()))]),
                );
            }
        }
        log_commit(
            &entry.id,
            entry.status.as_str(),
            entry.kind.as_str(),
            entry.c_total,
            entry.tensor.coherence,
        );
        self.remember(entry.clone());
        Ok(entry)
    }

    /// `prepare` + `append`. Status is `committed` when C_total meets the
    /// threshold, `pending` otherwise.
    pub fn commit(&mut self, input: CommitInput) -> Result<LedgerEntry> {
        let prepared = self.prepare(input)?;
        self.append(prepared)
    }

    /// Record a rollback that restored `restored` in place of `superseded_id`.
    pub fn append_rollback(
        &mut self,
        restored: &LedgerEntry,
        superseded_id: &str,
        reason: &str,
        tensor: LedgerTensor,
        mut meta: Map<String, Value>,
    ) -> Result<LedgerEntry> {
        meta.insert("rollback_of".to_string(), v_str(&restored.id));
        meta.insert("supersedes".to_string(), v_str(superseded_id));
        meta.insert("reason".to_string(), v_str(reason));
        let input = CommitInput::record("RepairManager", EntryKind::Rollback, tensor, meta)
            .with_status(EntryStatus::RolledBack)
            .with_link(&restored.id, "rollback_of");
        self.commit(input)
    }

    /// Newest committed field commit with a valid tensor that no rollback
    /// has superseded.
    pub fn last_committed(&self) -> Option<&LedgerEntry> {
        self.restorable.back()
    }

    pub fn last_committed_before(&self, exclude: &str) -> Option<&LedgerEntry> {
        self.restorable.iter().rev().find(|e| e.id != exclude)
    }

    /// Up to `n` newest records matching `keep`, oldest first. Falls back
    /// to the file when the tail holds fewer than `n` and older records exist.
    fn newest_matching(&self, n: usize, keep: impl Fn(&LedgerEntry) -> bool) -> Result<Vec<LedgerEntry>> {
        let mut out: Vec<LedgerEntry> = self.tail.iter().rev().filter(|e| keep(e)).take(n).cloned().collect();
        if out.len() < n && self.count > self.tail.len() {
            out = read_entries(self.path())?
                .into_iter()
                .rev()
                .filter(|e| keep(e))
                .take(n)
                .collect();
        }
        out.reverse();
        Ok(out)
    }

    /// Up to `n` newest committed field commits, oldest first.
    pub fn recent_commits(&self, n: usize) -> Result<Vec<LedgerEntry>> {
        self.newest_matching(n, LedgerEntry::is_field_commit)
    }

    /// Trend over the last `window` field commits (any status).
    pub fn trend_summary(&self, window: usize) -> Result<TrendSummary> {
        let tensors: Vec<LedgerTensor> = self
            .newest_matching(window, |e| e.kind == EntryKind::Commit && e.tensor.is_valid())?
            .into_iter()
            .map(|e| e.tensor)
            .collect();
        Ok(TrendSummary::from_tensors(&tensors))
    }

    /// Link the newest record to an external node.
    pub fn link_entry(&mut self, node_id: &str, relation: &str) -> Result<Option<LedgerEntry>> {
        let latest = match self.tail.back() {
            Some(e) => e.clone(),
            None => return Ok(None),
        };
        let mut meta = Map::new();
        meta.insert("link_of".to_string(), v_str(&latest.id));
        let input = CommitInput::record(&latest.observer, EntryKind::Link, latest.tensor, meta)
            .with_status(latest.status)
            .with_link(node_id, relation);
        self.commit(input).map(Some)
    }

    /// Copy the whole ledger file as a JSON array.
    pub fn export_json(&self, path: &Path) -> Result<usize> {
        let entries = read_entries(self.path())?;
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(entries.len())
    }
}

fn parse_lenient(line_no: usize, line: &str) -> Option<LedgerEntry> {
    match serde_json::from_str::<LedgerEntry>(line) {
        Ok(entry) => Some(entry),
        Err(err) => {
            log(
                Level::Warn,
                Domain::Ledger,
                "malformed_record",
                obj(&[("line", json!(line_no)), ("error", v_str(&err.to_string()))]),
            );
            None
        }
    }
}

/// Lenient reader: malformed lines are logged and skipped.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    let lines = read_ledger_lines(path)?;
    Ok(lines
        .into_iter()
        .filter_map(|(line_no, line)| parse_lenient(line_no, &line))
        .collect())
}

/// Strict reader for tools: first malformed line is an error.
pub fn read_entries_strict(path: &Path) -> Result<Vec<LedgerEntry>> {
    let lines = read_ledger_lines(path)?;
    let mut out = Vec::with_capacity(lines.len());
    for (line_no, line) in lines {
        let entry = serde_json::from_str::<LedgerEntry>(&line).map_err(|err| RuntimeError::MalformedRecord {
            line: line_no,
            reason: err.to_string(),
        })?;
        out.push(entry);
    }
    Ok(out)
}

fn read_ledger_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    if !path.exists() {
        return Err(RuntimeError::LedgerNotFound(PathBuf::from(path)));
    }
    Ok(LedgerLog::read_lines(path)?)
}
