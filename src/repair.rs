//! Instability detection and rollback to the last stable snapshot.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::RepairConfig;
use crate::error::{Result, RuntimeError};
use crate::events::BeamEvent;
use crate::field::FieldStore;
use crate::ledger::{Ledger, LedgerEntry};
use crate::logging::{log, log_rollback, obj, v_num, v_str, Domain, Level};
use crate::regulator::MorphicRegulator;
use crate::tensor::{LedgerTensor, TensorCompiler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstabilityReason {
    SqiBelowThreshold,
    PsiKappaDivergence,
    TemporalFluxCollapse,
    RegulatorSaturation,
    Veto,
}

impl InstabilityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstabilityReason::SqiBelowThreshold => "sqi_below_threshold",
            InstabilityReason::PsiKappaDivergence => "psi_kappa_divergence",
            InstabilityReason::TemporalFluxCollapse => "temporal_flux_collapse",
            InstabilityReason::RegulatorSaturation => "regulator_saturation",
            InstabilityReason::Veto => "veto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Stable,
    Repaired,
    RollbackFailed,
}

impl RepairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStatus::Stable => "stable",
            RepairStatus::Repaired => "repaired",
            RepairStatus::RollbackFailed => "rollback_failed",
        }
    }
}

/// Symbolic-layer input that travels with the beam.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolicState {
    pub allow_collapse: bool,
    pub veto_reason: Option<String>,
}

impl SymbolicState {
    pub fn permissive() -> Self {
        Self { allow_collapse: true, veto_reason: None }
    }

    pub fn from_beam(beam: Option<&BeamEvent>) -> Self {
        match beam {
            Some(b) => Self {
                allow_collapse: b.meta_bool("allow_collapse").unwrap_or(true),
                veto_reason: b.meta_str("veto_reason").map(str::to_string),
            },
            None => Self::permissive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub status: RepairStatus,
    pub restored: bool,
    pub repairs: u64,
    pub timestamp: f64,
    pub reasons: Vec<InstabilityReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veto_reason: Option<String>,
    /// Why the rollback failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The collaborators a repair touches. All borrowed under the tick lock.
pub struct RepairTargets<'a> {
    pub field: &'a FieldStore,
    pub regulator: &'a mut MorphicRegulator,
    pub ledger: &'a mut Ledger,
}

pub struct RepairManager {
    cfg: RepairConfig,
    repairs: u64,
}

impl RepairManager {
    pub fn new(cfg: &RepairConfig) -> Self {
        Self { cfg: cfg.clone(), repairs: 0 }
    }

    pub fn repair_count(&self) -> u64 {
        self.repairs
    }

    pub fn detect(&self, txn: &LedgerEntry, symbolic: &SymbolicState, saturated: bool) -> Vec<InstabilityReason> {
        let mut reasons = Vec::new();
        if txn.c_total < self.cfg.sqi_threshold {
            reasons.push(InstabilityReason::SqiBelowThreshold);
        }
        if (txn.tensor.psi - txn.tensor.kappa).abs() > self.cfg.psi_kappa_divergence {
            reasons.push(InstabilityReason::PsiKappaDivergence);
        }
        if txn.tensor.t < self.cfg.temporal_flux_floor {
            reasons.push(InstabilityReason::TemporalFluxCollapse);
        }
        if saturated {
            reasons.push(InstabilityReason::RegulatorSaturation);
        }
        if !symbolic.allow_collapse {
            reasons.push(InstabilityReason::Veto);
        }
        reasons
    }

    pub fn run_repair_cycle(
        &mut self,
        txn: &LedgerEntry,
        symbolic: &SymbolicState,
        saturated: bool,
        targets: RepairTargets<'_>,
        timestamp: f64,
    ) -> Result<RepairReport> {
        let reasons = self.detect(txn, symbolic, saturated);
        let mut report = RepairReport {
            status: RepairStatus::Stable,
            restored: false,
            repairs: self.repairs,
            timestamp,
            reasons: reasons.clone(),
            rollback_entry_id: None,
            restored_entry_id: None,
            veto_reason: symbolic.veto_reason.clone(),
            error: None,
        };
        if reasons.is_empty() {
            return Ok(report);
        }

        let reason_list: Vec<String> = reasons.iter().map(|r| r.as_str().to_string()).collect();
        log(
            Level::Warn,
            Domain::Repair,
            "instability",
            obj(&[
                ("entry_id", v_str(&txn.id)),
                ("reasons", json!(reason_list)),
                ("c_total", v_num(txn.c_total)),
            ]),
        );

        let stable = match targets.ledger.last_committed_before(&txn.id) {
            Some(entry) => entry.clone(),
            None => return Ok(self.failed(report, &txn.id, "no committed entry")),
        };
        let nodes = match stable.morphic_nodes() {
            Some(nodes) => nodes,
            None => return Ok(self.failed(report, &txn.id, "entry has no morphic_state")),
        };
        if let Err(err) = targets.field.restore(&nodes) {
            return Ok(self.failed(report, &txn.id, &err.to_string()));
        }

        let snapshot = targets.field.snapshot();
        let adjustment = targets.regulator.regulate(snapshot.tensor, &snapshot.nodes, timestamp);
        let tensor = LedgerTensor::from_field(
            adjustment.adjusted,
            adjustment.corrective,
            TensorCompiler::stability(&snapshot.nodes),
        );

        let mut meta = Map::new();
        meta.insert("reasons".to_string(), json!(reason_list));
        if let Some(veto) = &symbolic.veto_reason {
            meta.insert("veto_reason".to_string(), v_str(veto));
        } else if !symbolic.allow_collapse {
            meta.insert("veto_reason".to_string(), v_str("allow_collapse=false"));
        }
        meta.insert(
            "morphic_state".to_string(),
            json!({ "nodes": snapshot.nodes, "tensor": snapshot.tensor }),
        );
        meta.insert("adjustment".to_string(), serde_json::to_value(&adjustment)?);
        meta.insert("regulator".to_string(), serde_json::to_value(targets.regulator.state())?);

        let reason = reason_list.join(",");
        let rollback = targets
            .ledger
            .append_rollback(&stable, &txn.id, &reason, tensor, meta)?;

        self.repairs += 1;
        log_rollback(&rollback.id, &stable.id, &reason_list, snapshot.nodes.len());

        report.status = RepairStatus::Repaired;
        report.restored = true;
        report.repairs = self.repairs;
        report.rollback_entry_id = Some(rollback.id);
        report.restored_entry_id = Some(stable.id);
        if report.veto_reason.is_none() && !symbolic.allow_collapse {
            report.veto_reason = Some("allow_collapse=false".to_string());
        }
        Ok(report)
    }

    fn failed(&self, mut report: RepairReport, txn_id: &str, why: &str) -> RepairReport {
        let err = RuntimeError::RollbackFailed { reason: why.to_string() };
        log(
            Level::Error,
            Domain::Repair,
            "rollback_failed",
            obj(&[
                ("entry_id", v_str(txn_id)),
                ("kind", v_str(err.kind())),
                ("error", Value::String(err.to_string())),
            ]),
        );
        report.status = RepairStatus::RollbackFailed;
        report.error = Some(err.to_string());
        report
    }
}
