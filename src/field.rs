//! Live node set and its aggregate tensor.
//!
//! All mutation goes through one mutex. The tensor is never set directly;
//! it is recomputed from the node set after every change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::clock::SharedClock;
use crate::error::{Result, RuntimeError};
use crate::events::{BeamEvent, Metadata};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::tensor::{clamp01, FieldTensor, TensorCompiler};
use serde_json::json;

/// EMA factor applied when a beam lands on an existing node.
pub const MERGE_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldNode {
    pub node_id: String,
    pub beam_id: String,
    pub psi: f64,
    pub kappa: f64,
    #[serde(rename = "T")]
    pub t: f64,
    pub coherence: f64,
    pub entropy: f64,
    pub drift: f64,
    pub injected_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub semantic_overlay: Metadata,
}

impl FieldNode {
    fn from_beam(beam: &BeamEvent, now: f64) -> Self {
        let projected = TensorCompiler::from_beam(beam);
        Self {
            node_id: beam.node_id().to_string(),
            beam_id: beam.id.clone(),
            psi: projected.psi,
            kappa: projected.kappa,
            t: projected.t,
            coherence: clamp01(beam.coherence),
            entropy: clamp01(beam.entropy),
            drift: beam.phase_shift,
            injected_at: now,
            updated_at: now,
            semantic_overlay: beam.metadata.clone(),
        }
    }

    fn merge(&mut self, beam: &BeamEvent, now: f64) {
        let projected = TensorCompiler::from_beam(beam);
        let ema = |old: f64, new: f64| MERGE_FACTOR * old + (1.0 - MERGE_FACTOR) * new;
        self.psi = ema(self.psi, projected.psi);
        self.kappa = ema(self.kappa, projected.kappa);
        self.coherence = clamp01(ema(self.coherence, clamp01(beam.coherence)));
        self.entropy = clamp01(ema(self.entropy, clamp01(beam.entropy)));
        self.t = projected.t;
        self.drift = beam.phase_shift;
        self.beam_id = beam.id.clone();
        self.updated_at = now;
        for (k, v) in &beam.metadata {
            self.semantic_overlay.insert(k.clone(), v.clone());
        }
    }

    fn is_finite(&self) -> bool {
        [
            self.psi,
            self.kappa,
            self.t,
            self.coherence,
            self.entropy,
            self.drift,
            self.injected_at,
            self.updated_at,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Immutable copy of the field: ordered node list plus tensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub nodes: Vec<FieldNode>,
    pub tensor: FieldTensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Merged,
}

#[derive(Default)]
struct FieldInner {
    nodes: BTreeMap<String, FieldNode>,
    tensor: FieldTensor,
}

impl FieldInner {
    fn recompute(&mut self, now: f64) {
        self.tensor = TensorCompiler::from_nodes(self.nodes.values(), now);
    }

    fn snapshot(&self) -> FieldSnapshot {
        FieldSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            tensor: self.tensor,
        }
    }
}

pub struct FieldStore {
    inner: Mutex<FieldInner>,
    clock: SharedClock,
}

impl FieldStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(FieldInner::default()),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FieldInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or EMA-merge the node for this beam, then recompute the tensor.
    pub fn upsert_node(&self, beam: &BeamEvent) -> Result<Upsert> {
        beam.validate()?;
        let now = self.clock.now();
        let mut inner = self.lock();
        let outcome = match inner.nodes.get_mut(beam.node_id()) {
            Some(node) => {
                node.merge(beam, now);
                Upsert::Merged
            }
            None => {
                let node = FieldNode::from_beam(beam, now);
                inner.nodes.insert(node.node_id.clone(), node);
                Upsert::Created
            }
        };
        inner.recompute(now);
        log(
            Level::Trace,
            Domain::Field,
            "upsert",
            obj(&[
                ("node_id", v_str(beam.node_id())),
                ("created", json!(outcome == Upsert::Created)),
                ("nodes", json!(inner.nodes.len())),
            ]),
        );
        Ok(outcome)
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        self.lock().snapshot()
    }

    pub fn tensor(&self) -> FieldTensor {
        self.lock().tensor
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replace the node set. Nodes are installed verbatim apart
    /// from clamping coherence and entropy into [0, 1]; a non-finite node
    /// rejects the whole restore and leaves the store untouched.
    pub fn restore(&self, nodes: &[FieldNode]) -> Result<usize> {
        let mut fresh = BTreeMap::new();
        for node in nodes {
            if !node.is_finite() {
                return Err(RuntimeError::invalid_beam(
                    &node.node_id,
                    "snapshot node has non-finite fields",
                ));
            }
            let mut node = node.clone();
            node.coherence = clamp01(node.coherence);
            node.entropy = clamp01(node.entropy);
            fresh.insert(node.node_id.clone(), node);
        }
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.nodes = fresh;
        inner.recompute(now);
        Ok(inner.nodes.len())
    }

    /// Recompute the tensor against the current wall time.
    pub fn refresh(&self) -> FieldSnapshot {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.recompute(now);
        inner.snapshot()
    }

    pub fn clear(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.nodes.clear();
        inner.recompute(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store() -> FieldStore {
        FieldStore::new(Arc::new(ManualClock::new(1_700_000_500.0)))
    }

    #[test]
    fn test_first_beam_creates_node() {
        let fs = store();
        let up = fs.upsert_node(&BeamEvent::new("b0", 0.92, 0.08, 1.0)).unwrap();
        assert_eq!(up, Upsert::Created);
        let snap = fs.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert!((snap.tensor.coherence - 0.92).abs() < 1e-12);
        assert!((snap.tensor.psi - 0.08).abs() < 1e-12);
    }

    #[test]
    fn test_same_id_merges_with_ema() {
        let fs = store();
        fs.upsert_node(&BeamEvent::new("b0", 0.8, 0.2, 1.0)).unwrap();
        let up = fs.upsert_node(&BeamEvent::new("b0", 0.4, 0.6, 2.0)).unwrap();
        assert_eq!(up, Upsert::Merged);
        let snap = fs.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert!((snap.nodes[0].coherence - 0.6).abs() < 1e-12);
        assert!((snap.nodes[0].entropy - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let fs = store();
        fs.upsert_node(&BeamEvent::new("hot", 1.8, -0.5, 1.0)).unwrap();
        fs.upsert_node(&BeamEvent::new("wide", -0.2, 7.0, 1.0)).unwrap();
        for n in fs.snapshot().nodes {
            assert!((0.0..=1.0).contains(&n.coherence));
            assert!((0.0..=1.0).contains(&n.entropy));
        }
    }

    #[test]
    fn test_nan_rejected_without_mutation() {
        let fs = store();
        let mut beam = BeamEvent::new("b", 0.5, 0.1, 1.0);
        beam.phase_shift = f64::NAN;
        assert!(matches!(fs.upsert_node(&beam), Err(RuntimeError::InvalidBeam { .. })));
        assert!(fs.is_empty());
    }

    #[test]
    fn test_restore_replaces_node_set() {
        let fs = store();
        fs.upsert_node(&BeamEvent::new("a", 0.9, 0.1, 1.0)).unwrap();
        fs.upsert_node(&BeamEvent::new("b", 0.9, 0.1, 1.0)).unwrap();
        let saved = fs.snapshot();

        fs.upsert_node(&BeamEvent::new("c", 0.2, 0.9, 1.0)).unwrap();
        assert_eq!(fs.len(), 3);

        fs.restore(&saved.nodes).unwrap();
        assert_eq!(fs.snapshot().nodes, saved.nodes);
    }

    #[test]
    fn test_node_key_override() {
        let fs = store();
        fs.upsert_node(&BeamEvent::new("b1", 0.9, 0.1, 1.0).with_meta("node_id", "n")).unwrap();
        fs.upsert_node(&BeamEvent::new("b2", 0.7, 0.1, 2.0).with_meta("node_id", "n")).unwrap();
        let snap = fs.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].beam_id, "b2");
    }

    #[test]
    fn test_clear() {
        let fs = store();
        fs.upsert_node(&BeamEvent::new("a", 0.9, 0.1, 1.0)).unwrap();
        fs.clear();
        assert!(fs.is_empty());
        assert_eq!(fs.tensor(), FieldTensor::default());
    }
}
