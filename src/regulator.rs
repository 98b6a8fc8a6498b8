//! Morphic feedback regulator.
//!
//! Closed loop over mean field coherence: smooth the raw sample, take the
//! deviation from target, scale by an adaptive gain and damping, and nudge
//! ψ up and κ down by the resulting corrective. T passes through.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::config::RegulatorConfig;
use crate::field::FieldNode;
use crate::error::RuntimeError;
use crate::logging::{log, log_regulation, obj, v_str, Domain, Level};
use crate::tensor::FieldTensor;

pub const TARGET_MIN: f64 = 0.5;
pub const TARGET_MAX: f64 = 0.98;
/// |deviation| below this is "stabilized".
pub const STABLE_BAND: f64 = 0.02;
/// |corrective| above this is treated as instability.
pub const SATURATION_LIMIT: f64 = 1.0;

pub fn clamp_target(target: f64) -> f64 {
    if target.is_finite() {
        target.clamp(TARGET_MIN, TARGET_MAX)
    } else {
        TARGET_MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulationStatus {
    NoData,
    Stabilized,
    Adjusting,
}

impl RegulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegulationStatus::NoData => "no_data",
            RegulationStatus::Stabilized => "stabilized",
            RegulationStatus::Adjusting => "adjusting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatorState {
    pub target_coherence: f64,
    pub smoothing_factor: f64,
    pub gain: f64,
    pub damping: f64,
    pub last_deviation: f64,
    pub smoothed_coherence: Option<f64>,
}

/// Result of one regulation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub status: RegulationStatus,
    pub raw_coherence: f64,
    pub smoothed_coherence: f64,
    pub deviation: f64,
    pub adaptive_gain: f64,
    pub corrective: f64,
    pub target: f64,
    pub adjusted: FieldTensor,
    pub saturated: bool,
    pub timestamp: f64,
}

impl Adjustment {
    fn no_data(tensor: FieldTensor, target: f64, timestamp: f64) -> Self {
        Self {
            status: RegulationStatus::NoData,
            raw_coherence: 0.0,
            smoothed_coherence: 0.0,
            deviation: 0.0,
            adaptive_gain: 0.0,
            corrective: 0.0,
            target,
            adjusted: tensor,
            saturated: false,
            timestamp,
        }
    }
}

pub struct MorphicRegulator {
    state: RegulatorState,
    last_adjustment: Option<Adjustment>,
}

impl MorphicRegulator {
    pub fn new(cfg: &RegulatorConfig) -> Self {
        Self {
            state: RegulatorState {
                target_coherence: clamp_target(cfg.target_coherence),
                smoothing_factor: cfg.smoothing_factor,
                gain: cfg.gain,
                damping: cfg.damping,
                last_deviation: 0.0,
                smoothed_coherence: None,
            },
            last_adjustment: None,
        }
    }

    pub fn state(&self) -> &RegulatorState {
        &self.state
    }

    pub fn target(&self) -> f64 {
        self.state.target_coherence
    }

    pub fn last_adjustment(&self) -> Option<&Adjustment> {
        self.last_adjustment.as_ref()
    }

    /// External setpoint hint; always clamped into [0.5, 0.98].
    pub fn set_target(&mut self, target: f64) -> f64 {
        self.state.target_coherence = clamp_target(target);
        self.state.target_coherence
    }

    pub fn regulate(&mut self, tensor: FieldTensor, nodes: &[FieldNode], timestamp: f64) -> Adjustment {
        let target = self.state.target_coherence;
        if nodes.is_empty() {
            let adj = Adjustment::no_data(tensor, target, timestamp);
            log_regulation(adj.status.as_str(), 0.0, 0.0, 0.0, target);
            return adj;
        }

        let raw = nodes.iter().map(|n| n.coherence).sum::<f64>() / nodes.len() as f64;
        let s = self.state.smoothing_factor;
        let smoothed = match self.state.smoothed_coherence {
            Some(prev) => s * raw + (1.0 - s) * prev,
            None => raw,
        };
        let deviation = target - smoothed;
        let adaptive_gain = self.state.gain * (1.0 - 0.5 * self.state.last_deviation.abs());
        let corrective = adaptive_gain * deviation * self.state.damping;

        let adjusted = FieldTensor {
            psi: tensor.psi + corrective * s,
            kappa: tensor.kappa - corrective * 0.5,
            t: tensor.t,
            coherence: tensor.coherence,
        };
        let status = if deviation.abs() < STABLE_BAND {
            RegulationStatus::Stabilized
        } else {
            RegulationStatus::Adjusting
        };

        self.state.last_deviation = deviation;
        self.state.smoothed_coherence = Some(smoothed);

        let adj = Adjustment {
            status,
            raw_coherence: raw,
            smoothed_coherence: smoothed,
            deviation,
            adaptive_gain,
            corrective,
            target,
            adjusted,
            saturated: corrective.abs() > SATURATION_LIMIT,
            timestamp,
        };
        log_regulation(status.as_str(), smoothed, deviation, corrective, target);
        if adj.saturated {
            let err = RuntimeError::RegulatorSaturation { corrective };
            log(
                Level::Warn,
                Domain::Regulator,
                "saturated",
                obj(&[("kind", v_str(err.kind())), ("error", v_str(&err.to_string()))]),
            );
        }
        self.last_adjustment = Some(adj.clone());
        adj
    }
}

// =============================================================================
// Setpoint hints
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetpointHint {
    pub target: f64,
    pub source: HintSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSource {
    Peer,
    Convergence,
}

/// Mailbox for target hints produced off-tick. The engine drains it at the
/// start of each tick; the newest hint wins.
#[derive(Debug, Clone, Default)]
pub struct SetpointHandle {
    pending: Arc<Mutex<Option<SetpointHint>>>,
}

impl SetpointHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, target: f64, source: HintSource) -> f64 {
        let clamped = clamp_target(target);
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(SetpointHint {
            target: clamped,
            source,
        });
        clamped
    }

    pub fn take(&self) -> Option<SetpointHint> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn peek(&self) -> Option<SetpointHint> {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(c: f64) -> FieldNode {
        FieldNode {
            node_id: format!("n{}", c),
            beam_id: "b".into(),
            psi: 0.0,
            kappa: 0.0,
            t: 0.0,
            coherence: c,
            entropy: 0.1,
            drift: 0.0,
            injected_at: 0.0,
            updated_at: 0.0,
            semantic_overlay: Default::default(),
        }
    }

    fn tensor(c: f64) -> FieldTensor {
        FieldTensor { psi: 0.1, kappa: 0.02, t: 500.0, coherence: c }
    }

    #[test]
    fn test_no_data() {
        let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
        let adj = reg.regulate(FieldTensor::default(), &[], 1.0);
        assert_eq!(adj.status, RegulationStatus::NoData);
        assert_eq!(adj.adjusted, FieldTensor::default());
        assert_eq!(reg.state().smoothed_coherence, None);
    }

    #[test]
    fn test_on_target_emits_no_correction() {
        let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
        let adj = reg.regulate(tensor(0.92), &[node(0.92)], 1.0);
        assert!(adj.corrective.abs() < 1e-9);
        assert_eq!(adj.status, RegulationStatus::Stabilized);
        assert_eq!(adj.adjusted.psi, 0.1);
    }

    #[test]
    fn test_below_target_raises_psi_lowers_kappa() {
        let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
        let adj = reg.regulate(tensor(0.7), &[node(0.7)], 1.0);
        // d = 0.22, g = 0.5, corrective = 0.5 * 0.22 * 0.8
        assert!((adj.corrective - 0.088).abs() < 1e-12);
        assert!((adj.adjusted.psi - (0.1 + 0.088 * 0.25)).abs() < 1e-12);
        assert!((adj.adjusted.kappa - (0.02 - 0.044)).abs() < 1e-12);
        assert_eq!(adj.adjusted.t, 500.0);
        assert_eq!(adj.status, RegulationStatus::Adjusting);
    }

    #[test]
    fn test_smoothing_and_adaptive_gain() {
        let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
        reg.regulate(tensor(0.9), &[node(0.9)], 1.0);
        let adj = reg.regulate(tensor(0.5), &[node(0.5)], 2.0);
        let smoothed = 0.25 * 0.5 + 0.75 * 0.9;
        assert!((adj.smoothed_coherence - smoothed).abs() < 1e-12);
        let gain = 0.5 * (1.0 - 0.5 * 0.02);
        assert!((adj.adaptive_gain - gain).abs() < 1e-12);
    }

    #[test]
    fn test_stabilized_pass_barely_moves_smoothing() {
        let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
        reg.regulate(tensor(0.91), &[node(0.91)], 1.0);
        let before = reg.state().smoothed_coherence.unwrap();
        let adj = reg.regulate(tensor(0.91), &[node(0.91)], 2.0);
        assert_eq!(adj.status, RegulationStatus::Stabilized);
        let after = reg.state().smoothed_coherence.unwrap();
        assert!((after - before).abs() <= 0.25 * 0.02);
    }

    #[test]
    fn test_saturation_flag() {
        let cfg = RegulatorConfig { gain: 20.0, ..Default::default() };
        let mut reg = MorphicRegulator::new(&cfg);
        let adj = reg.regulate(tensor(0.1), &[node(0.1)], 1.0);
        assert!(adj.saturated);
    }

    #[test]
    fn test_target_clamped() {
        let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
        assert_eq!(reg.set_target(1.5), 0.98);
        assert_eq!(reg.set_target(0.1), 0.5);
        assert_eq!(reg.set_target(0.88), 0.88);
    }

    #[test]
    fn test_setpoint_handle_newest_wins() {
        let h = SetpointHandle::new();
        h.request(0.6, HintSource::Convergence);
        h.request(0.99, HintSource::Peer);
        let hint = h.take().unwrap();
        assert_eq!(hint.target, 0.98);
        assert_eq!(hint.source, HintSource::Peer);
        assert!(h.take().is_none());
    }
}
