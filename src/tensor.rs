//! Field tensors and the pure compiler that produces them.
//!
//! `T` is advisory: it is derived from wall time and mean coherence and
//! carries no causal meaning beyond the repair floor check.

use serde::{Deserialize, Serialize};

use crate::events::BeamEvent;
use crate::field::FieldNode;

pub const EPSILON: f64 = 1e-9;

/// Aggregate (ψ, κ, T, C) state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTensor {
    pub psi: f64,
    pub kappa: f64,
    #[serde(rename = "T")]
    pub t: f64,
    pub coherence: f64,
}

impl FieldTensor {
    pub fn is_finite(&self) -> bool {
        self.psi.is_finite() && self.kappa.is_finite() && self.t.is_finite() && self.coherence.is_finite()
    }
}

/// Tensor as recorded in a ledger entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTensor {
    pub psi: f64,
    pub kappa: f64,
    #[serde(rename = "T")]
    pub t: f64,
    pub coherence: f64,
    #[serde(default)]
    pub gradient: f64,
    #[serde(default)]
    pub stability: f64,
}

impl LedgerTensor {
    pub fn from_field(tensor: FieldTensor, gradient: f64, stability: f64) -> Self {
        Self {
            psi: tensor.psi,
            kappa: tensor.kappa,
            t: tensor.t,
            coherence: tensor.coherence,
            gradient,
            stability,
        }
    }

    pub fn field(&self) -> FieldTensor {
        FieldTensor {
            psi: self.psi,
            kappa: self.kappa,
            t: self.t,
            coherence: self.coherence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.field().is_finite() && self.gradient.is_finite() && self.stability.is_finite()
    }
}

pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Population standard deviation; 0 for fewer than two samples.
pub fn pstdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Maps a beam, a node set, or a window of recorded tensors to a tensor.
/// Deterministic and side-effect free.
pub struct TensorCompiler;

impl TensorCompiler {
    /// Single-beam projection.
    ///
    /// ψ = clamp(1 − drift_entropy), κ = tanh(curve_length / 50)·(1 − C),
    /// T = tick_time / max(field_decay, ε).
    pub fn from_beam(beam: &BeamEvent) -> FieldTensor {
        let coherence = clamp01(beam.coherence);
        let drift_entropy = clamp01(beam.entropy);
        let curve_length = beam
            .meta_f64("resonance_curve_length")
            .unwrap_or(beam.gain);
        let tick_time = beam
            .meta_f64("tick_time")
            .unwrap_or(beam.timestamp.rem_euclid(1000.0));
        let field_decay = beam.meta_f64("field_decay").unwrap_or(1.0);

        FieldTensor {
            psi: clamp01(1.0 - drift_entropy),
            kappa: (curve_length / 50.0).tanh() * (1.0 - coherence),
            t: tick_time / field_decay.max(EPSILON),
            coherence,
        }
    }

    /// Aggregate over the live node set. Empty set is all zeros.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a FieldNode>, wall_time: f64) -> FieldTensor {
        let nodes: Vec<&FieldNode> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return FieldTensor::default();
        }
        let psi = mean(nodes.iter().map(|n| n.entropy)).unwrap_or(0.0);
        let coherence = mean(nodes.iter().map(|n| n.coherence)).unwrap_or(0.0);
        FieldTensor {
            psi,
            kappa: (nodes.len() as f64 / 50.0).tanh(),
            t: wall_time.rem_euclid(1000.0) / coherence.max(EPSILON),
            coherence,
        }
    }

    /// Component-wise mean of a telemetry window.
    pub fn from_window(window: &[LedgerTensor]) -> FieldTensor {
        FieldTensor {
            psi: mean(window.iter().map(|t| t.psi)).unwrap_or(0.0),
            kappa: mean(window.iter().map(|t| t.kappa)).unwrap_or(0.0),
            t: mean(window.iter().map(|t| t.t)).unwrap_or(0.0),
            coherence: mean(window.iter().map(|t| t.coherence)).unwrap_or(0.0),
        }
    }

    /// 1 − pstdev(node coherence), floored at 0.
    pub fn stability<'a>(nodes: impl IntoIterator<Item = &'a FieldNode>) -> f64 {
        let values: Vec<f64> = nodes.into_iter().map(|n| n.coherence).collect();
        if values.is_empty() {
            return 0.0;
        }
        (1.0 - pstdev(&values)).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, coherence: f64, entropy: f64) -> FieldNode {
        FieldNode {
            node_id: id.to_string(),
            beam_id: id.to_string(),
            psi: 0.0,
            kappa: 0.0,
            t: 0.0,
            coherence,
            entropy,
            drift: 0.0,
            injected_at: 0.0,
            updated_at: 0.0,
            semantic_overlay: Default::default(),
        }
    }

    #[test]
    fn test_empty_nodes_zero_tensor() {
        let t = TensorCompiler::from_nodes(std::iter::empty(), 1234.0);
        assert_eq!(t, FieldTensor::default());
    }

    #[test]
    fn test_aggregate_formulas() {
        let nodes = vec![node("a", 0.8, 0.2), node("b", 1.0, 0.0)];
        let t = TensorCompiler::from_nodes(&nodes, 1_700_000_450.0);
        assert!((t.psi - 0.1).abs() < 1e-12);
        assert!((t.coherence - 0.9).abs() < 1e-12);
        assert!((t.kappa - (2.0f64 / 50.0).tanh()).abs() < 1e-12);
        assert!((t.t - 450.0 / 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_beam_projection() {
        let beam = BeamEvent::new("b", 0.6, 0.25, 2500.0)
            .with_meta("resonance_curve_length", 25.0)
            .with_meta("field_decay", 2.0);
        let t = TensorCompiler::from_beam(&beam);
        assert!((t.psi - 0.75).abs() < 1e-12);
        assert!((t.kappa - 0.5f64.tanh() * 0.4).abs() < 1e-12);
        assert!((t.t - 250.0).abs() < 1e-9);
        assert_eq!(t.coherence, 0.6);
    }

    #[test]
    fn test_beam_projection_is_idempotent() {
        let beam = BeamEvent::new("b", 0.9, 0.1, 10.0);
        assert_eq!(TensorCompiler::from_beam(&beam), TensorCompiler::from_beam(&beam));
    }

    #[test]
    fn test_zero_decay_floored() {
        let beam = BeamEvent::new("b", 0.9, 0.1, 10.0).with_meta("field_decay", 0.0);
        assert!(TensorCompiler::from_beam(&beam).t.is_finite());
    }

    #[test]
    fn test_window_mean_and_stability() {
        let window = vec![
            LedgerTensor { psi: 0.1, kappa: 0.2, t: 100.0, coherence: 0.8, ..Default::default() },
            LedgerTensor { psi: 0.3, kappa: 0.4, t: 300.0, coherence: 1.0, ..Default::default() },
        ];
        let t = TensorCompiler::from_window(&window);
        assert!((t.psi - 0.2).abs() < 1e-12);
        assert!((t.t - 200.0).abs() < 1e-12);

        let nodes = vec![node("a", 0.8, 0.0), node("b", 1.0, 0.0)];
        assert!((TensorCompiler::stability(&nodes) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_ledger_tensor_serializes_capital_t() {
        let t = LedgerTensor { psi: 0.1, kappa: 0.2, t: 3.0, coherence: 0.9, gradient: 0.0, stability: 1.0 };
        let v = serde_json::to_value(t).unwrap();
        assert_eq!(v["T"], 3.0);
        assert!(v.get("t").is_none());
    }
}
