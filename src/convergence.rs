//! Periodic re-tuning of the regulator target from the ledger's recent
//! coherence window.

use serde::Serialize;
use serde_json::{json, Map};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::config::ConvergenceConfig;
use crate::error::Result;
use crate::ledger::{CommitInput, EntryKind, Ledger, LedgerEntry};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::regulator::{clamp_target, HintSource, SetpointHandle};
use crate::tensor::{pstdev, LedgerTensor, TensorCompiler};

pub const OBSERVER: &str = "ConvergenceLoop";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub window: usize,
    pub mean: f64,
    pub std: f64,
    pub current_target: f64,
    /// Target requested through the setpoint handle, if the window was
    /// unsettled.
    pub requested: Option<f64>,
}

pub struct ConvergenceLoop {
    cfg: ConvergenceConfig,
    default_target: f64,
    setpoints: SetpointHandle,
}

impl ConvergenceLoop {
    pub fn new(cfg: &ConvergenceConfig, default_target: f64, setpoints: SetpointHandle) -> Self {
        Self {
            cfg: cfg.clone(),
            default_target: clamp_target(default_target),
            setpoints,
        }
    }

    /// One pass: read the window, maybe request a relaxed target, and
    /// always leave a `feedback` record behind.
    pub fn step(&self, ledger: &mut Ledger) -> Result<(ConvergenceReport, LedgerEntry)> {
        let window: Vec<LedgerTensor> = ledger
            .recent_commits(self.cfg.window.max(1))?
            .into_iter()
            .map(|e| e.tensor)
            .collect();
        let coherences: Vec<f64> = window.iter().map(|t| t.coherence).collect();
        let mean = if coherences.is_empty() {
            0.0
        } else {
            coherences.iter().sum::<f64>() / coherences.len() as f64
        };
        let std = pstdev(&coherences);
        let current_target = ledger
            .last_committed()
            .and_then(LedgerEntry::regulator_target)
            .unwrap_or(self.default_target);

        let requested = if !coherences.is_empty() && std > self.cfg.std_threshold {
            let proposed = current_target + self.cfg.relax * (mean - current_target);
            Some(self.setpoints.request(proposed, HintSource::Convergence))
        } else {
            None
        };
        let report = ConvergenceReport {
            window: coherences.len(),
            mean,
            std,
            current_target,
            requested,
        };

        let tensor = LedgerTensor::from_field(TensorCompiler::from_window(&window), 0.0, 1.0 - std);
        let mut meta = Map::new();
        meta.insert("convergence".to_string(), json!(report));
        let entry = ledger.commit(CommitInput::record(OBSERVER, EntryKind::Feedback, tensor, meta))?;

        log(
            Level::Info,
            Domain::Convergence,
            "step",
            obj(&[
                ("entry_id", v_str(&entry.id)),
                ("window", json!(report.window)),
                ("mean", v_num(mean)),
                ("std", v_num(std)),
                ("requested", json!(requested)),
            ]),
        );
        Ok((report, entry))
    }

    /// Step every `period` until shutdown. Errors are logged, never raised.
    pub async fn run(self, ledger: Arc<Mutex<Ledger>>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.cfg.period);
        // the first tick fires immediately; skip it so the window has data
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut ledger = ledger.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(err) = self.step(&mut ledger) {
                        log(
                            Level::Warn,
                            Domain::Convergence,
                            "step_failed",
                            obj(&[("error", v_str(&err.to_string()))]),
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        log(Level::Info, Domain::Convergence, "stopped", Map::new());
    }
}
