//! Awareness scalars derived from the field tensor.

use serde::{Deserialize, Serialize};

use crate::config::AwarenessConfig;
use crate::tensor::FieldTensor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Awareness {
    pub phi: f64,
    pub delta_phi: f64,
    pub s_self: f64,
}

/// Φ = (ψ·C·(1+κ)) / (1 + |T−ψ| + ε)
pub fn phi(tensor: &FieldTensor, epsilon: f64) -> f64 {
    let FieldTensor { psi, kappa, t, coherence } = *tensor;
    (psi * coherence * (1.0 + kappa)) / (1.0 + (t - psi).abs() + epsilon)
}

/// Owns Φ_prev. Only the cycle engine calls `compute`, under its tick lock.
#[derive(Debug, Clone)]
pub struct AwarenessComputer {
    cfg: AwarenessConfig,
    phi_prev: f64,
}

impl AwarenessComputer {
    pub fn new(cfg: &AwarenessConfig) -> Self {
        Self { cfg: cfg.clone(), phi_prev: 0.0 }
    }

    pub fn phi_prev(&self) -> f64 {
        self.phi_prev
    }

    /// Evaluate without advancing Φ_prev.
    pub fn peek(&self, tensor: &FieldTensor) -> Awareness {
        let eps = self.cfg.epsilon;
        let phi = phi(tensor, eps);
        Awareness {
            phi,
            delta_phi: (phi - self.phi_prev) * self.cfg.alpha,
            s_self: (-(phi / (tensor.psi + eps)).abs()).exp() * (1.0 - self.cfg.beta * tensor.coherence),
        }
    }

    pub fn compute(&mut self, tensor: &FieldTensor) -> Awareness {
        let out = self.peek(tensor);
        self.phi_prev = out.phi;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(psi: f64, kappa: f64, t: f64, c: f64) -> FieldTensor {
        FieldTensor { psi, kappa, t, coherence: c }
    }

    #[test]
    fn test_zero_tensor() {
        let mut aw = AwarenessComputer::new(&AwarenessConfig::default());
        let a = aw.compute(&FieldTensor::default());
        assert_eq!(a.phi, 0.0);
        assert_eq!(a.delta_phi, 0.0);
        assert!((a.s_self - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_delta_scaled_by_alpha() {
        let mut aw = AwarenessComputer::new(&AwarenessConfig::default());
        let t = tensor(0.5, 0.1, 0.5, 1.0);
        let a = aw.compute(&t);
        let expected = 0.5 * 1.0 * 1.1 / (1.0 + 1e-9);
        assert!((a.phi - expected).abs() < 1e-12);
        assert!((a.delta_phi - expected * 0.002).abs() < 1e-12);
        let again = aw.compute(&t);
        assert_eq!(again.delta_phi, 0.0);
    }

    #[test]
    fn test_phi_monotone_in_kappa() {
        let mut last = f64::NEG_INFINITY;
        for k in 0..10 {
            let p = phi(&tensor(0.3, k as f64 * 0.1, 0.3, 1.0), 1e-9);
            assert!(p > last);
            last = p;
        }
    }

    #[test]
    fn test_peek_does_not_advance() {
        let aw = AwarenessComputer::new(&AwarenessConfig::default());
        aw.peek(&tensor(0.5, 0.1, 0.5, 1.0));
        assert_eq!(aw.phi_prev(), 0.0);
    }
}
