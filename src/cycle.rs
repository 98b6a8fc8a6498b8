//! Tick orchestration.
//!
//! One `run_cycle` is one tick: ingest → compute → regulate → commit →
//! repair → broadcast. The engine is the only writer of the field and the
//! awareness state; callers serialize ticks by holding the engine behind a
//! single lock.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

use crate::awareness::{Awareness, AwarenessComputer};
use crate::clock::SharedClock;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::events::BeamEvent;
use crate::field::{FieldNode, FieldStore};
use crate::ledger::{digest, CoherenceScores, CommitInput, Ledger, LedgerEntry};
use crate::logging::{
    log, log_audit, log_tick, obj, tick_aggregator, v_num, v_str, Domain, Level, ProfileScope,
};
use crate::regulator::{Adjustment, MorphicRegulator, RegulationStatus, SetpointHandle};
use crate::repair::{RepairManager, RepairReport, RepairStatus, RepairTargets, SymbolicState};
use crate::stream::WsStreamer;
use crate::telemetry::TelemetryDb;
use crate::tensor::{FieldTensor, LedgerTensor, TensorCompiler};

pub const OBSERVER: &str = "CycleEngine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    Idle,
    Ingest,
    Compute,
    Regulate,
    Commit,
    Repair,
    Broadcast,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Stable,
    Adjusting,
    Repaired,
    /// Repair was needed but nothing stable was available.
    Degraded,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Stable => "stable",
            TickOutcome::Adjusting => "adjusting",
            TickOutcome::Repaired => "repaired",
            TickOutcome::Degraded => "degraded",
        }
    }
}

/// What a tick returns and what subscribers see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub session_id: String,
    pub tick: u64,
    pub outcome: TickOutcome,
    /// Tensor of the last record written this tick.
    pub tensor: FieldTensor,
    pub nodes: Vec<FieldNode>,
    pub adjustment: Adjustment,
    pub awareness: Awareness,
    pub entry: LedgerEntry,
    pub rollback: Option<LedgerEntry>,
    pub repair: RepairReport,
    pub timestamp: f64,
}

impl CycleSnapshot {
    pub fn frame(&self) -> Value {
        json!({
            "type": "field_state",
            "session_id": self.session_id,
            "tick": self.tick,
            "field_tensor": self.tensor,
            "adjustment": self.adjustment,
            "awareness": self.awareness,
            "outcome": self.outcome.as_str(),
            "entry_id": self.rollback.as_ref().unwrap_or(&self.entry).id,
            "timestamp": self.timestamp,
        })
    }
}

pub struct CycleEngine {
    session_id: String,
    phase_threshold: f64,
    clock: SharedClock,
    field: Arc<FieldStore>,
    regulator: MorphicRegulator,
    awareness: AwarenessComputer,
    repair: RepairManager,
    ledger: Arc<Mutex<Ledger>>,
    telemetry: Option<Arc<Mutex<TelemetryDb>>>,
    streamer: Option<Arc<WsStreamer>>,
    setpoints: SetpointHandle,
    phase: TickPhase,
    ticks: u64,
}

impl CycleEngine {
    pub fn new(cfg: &RuntimeConfig, clock: SharedClock, ledger: Arc<Mutex<Ledger>>) -> Self {
        Self {
            session_id: cfg.session_id.clone(),
            phase_threshold: cfg.phase_threshold,
            field: Arc::new(FieldStore::new(clock.clone())),
            clock,
            regulator: MorphicRegulator::new(&cfg.regulator),
            awareness: AwarenessComputer::new(&cfg.awareness),
            repair: RepairManager::new(&cfg.repair),
            ledger,
            telemetry: None,
            streamer: None,
            setpoints: SetpointHandle::new(),
            phase: TickPhase::Idle,
            ticks: 0,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Mutex<TelemetryDb>>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_streamer(mut self, streamer: Arc<WsStreamer>) -> Self {
        self.streamer = Some(streamer);
        self
    }

    pub fn with_setpoints(mut self, setpoints: SetpointHandle) -> Self {
        self.setpoints = setpoints;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn field(&self) -> &Arc<FieldStore> {
        &self.field
    }

    pub fn regulator(&self) -> &MorphicRegulator {
        &self.regulator
    }

    pub fn awareness(&self) -> &AwarenessComputer {
        &self.awareness
    }

    pub fn repair(&self) -> &RepairManager {
        &self.repair
    }

    pub fn setpoints(&self) -> SetpointHandle {
        self.setpoints.clone()
    }

    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run_cycle(&mut self, beam: Option<BeamEvent>) -> Result<CycleSnapshot> {
        let _profile = ProfileScope::with_context("run_cycle", &[("session_id", v_str(&self.session_id))]);
        self.ticks += 1;
        let tick = self.ticks;

        // INGEST
        self.phase = TickPhase::Ingest;
        if let Some(hint) = self.setpoints.take() {
            let target = self.regulator.set_target(hint.target);
            log(
                Level::Info,
                Domain::Regulator,
                "target_updated",
                obj(&[("target", v_num(target)), ("source", json!(hint.source))]),
            );
        }
        if let Some(beam) = &beam {
            if let Err(err) = self.field.upsert_node(beam) {
                self.phase = TickPhase::Idle;
                log(
                    Level::Warn,
                    Domain::Cycle,
                    "beam_rejected",
                    obj(&[("beam_id", v_str(&beam.id)), ("error", v_str(&err.to_string()))]),
                );
                return Err(err);
            }
        }

        // COMPUTE
        self.phase = TickPhase::Compute;
        let now = self.clock.now();
        let snapshot = self.field.refresh();

        // REGULATE
        self.phase = TickPhase::Regulate;
        let adjustment = self.regulator.regulate(snapshot.tensor, &snapshot.nodes, now);
        let awareness = self.awareness.compute(&snapshot.tensor);

        // COMMIT
        self.phase = TickPhase::Commit;
        let scores = commit_scores(beam.as_ref(), &snapshot.tensor, &adjustment);
        let ledger_tensor = LedgerTensor::from_field(
            adjustment.adjusted,
            adjustment.corrective,
            TensorCompiler::stability(&snapshot.nodes),
        );
        let morphic_state = json!({ "nodes": snapshot.nodes, "tensor": snapshot.tensor });
        let state_hash = digest(&morphic_state);
        let mut meta = Map::new();
        meta.insert("tick".to_string(), json!(tick));
        meta.insert("morphic_state".to_string(), morphic_state);
        meta.insert("snapshot_hash".to_string(), v_str(&state_hash));
        meta.insert("regulator".to_string(), serde_json::to_value(self.regulator.state())?);
        meta.insert("adjustment".to_string(), serde_json::to_value(&adjustment)?);
        meta.insert("awareness".to_string(), serde_json::to_value(awareness)?);
        meta.insert("scores".to_string(), serde_json::to_value(scores)?);
        if let Some(b) = &beam {
            meta.insert("beam_id".to_string(), v_str(&b.id));
        }
        let mut input = CommitInput::commit(OBSERVER, ledger_tensor, scores, meta);
        if let Some(b) = &beam {
            input = input.with_link(b.node_id(), "ingest");
        }

        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let entry = match ledger.commit(input) {
            Ok(entry) => entry,
            Err(err) => {
                self.phase = TickPhase::Aborted;
                log(
                    Level::Error,
                    Domain::Cycle,
                    "tick_aborted",
                    obj(&[
                        ("session_id", v_str(&self.session_id)),
                        ("tick", json!(tick)),
                        ("kind", v_str(err.kind())),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                return Err(err);
            }
        };
        log_audit("commit", &entry.id, &state_hash);

        // REPAIR
        self.phase = TickPhase::Repair;
        let repair = if adjustment.status == RegulationStatus::NoData {
            RepairReport {
                status: RepairStatus::Stable,
                restored: false,
                repairs: self.repair.repair_count(),
                timestamp: now,
                reasons: Vec::new(),
                rollback_entry_id: None,
                restored_entry_id: None,
                veto_reason: None,
                error: None,
            }
        } else {
            let symbolic = SymbolicState::from_beam(beam.as_ref());
            let targets = RepairTargets {
                field: &self.field,
                regulator: &mut self.regulator,
                ledger: &mut ledger,
            };
            match self
                .repair
                .run_repair_cycle(&entry, &symbolic, adjustment.saturated, targets, now)
            {
                Ok(report) => report,
                Err(err) => {
                    self.phase = TickPhase::Aborted;
                    log(
                        Level::Error,
                        Domain::Cycle,
                        "tick_aborted",
                        obj(&[
                            ("session_id", v_str(&self.session_id)),
                            ("entry_id", v_str(&entry.id)),
                            ("kind", v_str(err.kind())),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    return Err(err);
                }
            }
        };
        let rollback = repair
            .rollback_entry_id
            .as_deref()
            .and_then(|id| ledger.find(id))
            .cloned();
        drop(ledger);

        // Re-derive once from the restored field; no second primary commit.
        let (nodes, tensor, adjustment, awareness) = match (&rollback, repair.status) {
            (Some(rb), RepairStatus::Repaired) => {
                let restored = self.field.snapshot();
                let adj = self.regulator.last_adjustment().cloned().unwrap_or(adjustment);
                let aw = self.awareness.compute(&restored.tensor);
                (restored.nodes, rb.tensor.field(), adj, aw)
            }
            _ => (snapshot.nodes, entry.tensor.field(), adjustment, awareness),
        };

        if let Some(telemetry) = &self.telemetry {
            let mut db = telemetry.lock().unwrap_or_else(|e| e.into_inner());
            for record in std::iter::once(&entry).chain(rollback.as_ref()) {
                if let Err(err) = db.ingest(record, &self.session_id) {
                    log(
                        Level::Warn,
                        Domain::Telemetry,
                        "ingest_failed",
                        obj(&[("entry_id", v_str(&record.id)), ("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }

        let outcome = match repair.status {
            RepairStatus::Repaired => TickOutcome::Repaired,
            RepairStatus::RollbackFailed => TickOutcome::Degraded,
            RepairStatus::Stable => match adjustment.status {
                RegulationStatus::Adjusting => TickOutcome::Adjusting,
                _ => TickOutcome::Stable,
            },
        };

        if awareness.delta_phi.abs() > self.phase_threshold {
            log(
                Level::Warn,
                Domain::Cycle,
                "phase_drift",
                obj(&[
                    ("session_id", v_str(&self.session_id)),
                    ("delta_phi", v_num(awareness.delta_phi)),
                    ("threshold", v_num(self.phase_threshold)),
                ]),
            );
        }

        let result = CycleSnapshot {
            session_id: self.session_id.clone(),
            tick,
            outcome,
            tensor,
            nodes,
            adjustment,
            awareness,
            entry,
            rollback,
            repair,
            timestamp: now,
        };

        // BROADCAST
        self.phase = TickPhase::Broadcast;
        if let Some(streamer) = &self.streamer {
            streamer.broadcast(&result.frame().to_string());
        }

        log_tick(
            &self.session_id,
            tick,
            outcome.as_str(),
            &result.entry.id,
            result.tensor.coherence,
            result.awareness.phi,
        );
        tick_aggregator();
        self.phase = TickPhase::Idle;
        Ok(result)
    }

    /// Last committed entry, for callers that only hold the engine.
    pub fn last_committed(&self) -> Option<LedgerEntry> {
        self.lock_ledger().last_committed().cloned()
    }
}

/// C_holo is the field's mean coherence, C_phot the incoming beam's (field
/// C on idle ticks), C_sym either the producer's own score or 1 − |d|.
pub fn commit_scores(beam: Option<&BeamEvent>, tensor: &FieldTensor, adj: &Adjustment) -> CoherenceScores {
    let holographic = tensor.coherence;
    let photonic = beam.map(|b| b.coherence.clamp(0.0, 1.0)).unwrap_or(holographic);
    let symbolic = match beam.and_then(|b| b.meta_f64("symbolic_coherence")) {
        Some(s) => s.clamp(0.0, 1.0),
        None if adj.status == RegulationStatus::NoData => 0.0,
        None => (1.0 - adj.deviation.abs()).clamp(0.0, 1.0),
    };
    CoherenceScores { symbolic, photonic, holographic }
}
