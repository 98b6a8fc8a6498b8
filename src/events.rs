//! Beam events: the unit of input to the runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, RuntimeError};

/// Closed vocabulary of event tags. Collaborators may emit other tags;
/// the core carries them through `Other` and never dispatches on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Ingest,
    Regulate,
    Commit,
    Rollback,
    Feedback,
    Broadcast,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ingest => "ingest",
            EventKind::Regulate => "regulate",
            EventKind::Commit => "commit",
            EventKind::Rollback => "rollback",
            EventKind::Feedback => "feedback",
            EventKind::Broadcast => "broadcast",
            EventKind::Other(tag) => tag,
        }
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ingest" => EventKind::Ingest,
            "regulate" => EventKind::Regulate,
            "commit" => EventKind::Commit,
            "rollback" => EventKind::Rollback,
            "feedback" => EventKind::Feedback,
            "broadcast" => EventKind::Broadcast,
            _ => EventKind::Other(tag),
        }
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        EventKind::from(tag.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata value. Unknown producer keys land here rather than on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

pub type Metadata = BTreeMap<String, Scalar>;

/// Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamEvent {
    pub id: String,
    pub event_type: EventKind,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    pub timestamp: f64,
    pub coherence: f64,
    pub entropy: f64,
    #[serde(default)]
    pub phase_shift: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_gain() -> f64 {
    1.0
}

impl BeamEvent {
    pub fn new(id: &str, coherence: f64, entropy: f64, timestamp: f64) -> Self {
        Self {
            id: id.to_string(),
            event_type: EventKind::Ingest,
            source: String::new(),
            target: String::new(),
            timestamp,
            coherence,
            entropy,
            phase_shift: 0.0,
            gain: 1.0,
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Scalar>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Scalar::as_f64)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Scalar::as_bool)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Scalar::as_str)
    }

    /// Key of the field node this beam projects onto.
    pub fn node_id(&self) -> &str {
        self.meta_str("node_id").unwrap_or(&self.id)
    }

    /// Reject beams the field cannot absorb: empty id, non-finite numbers,
    /// non-positive gain. Out-of-range coherence/entropy are clamped later,
    /// not rejected.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuntimeError::invalid_beam(&self.id, "missing id"));
        }
        let numeric = [
            ("timestamp", self.timestamp),
            ("coherence", self.coherence),
            ("entropy", self.entropy),
            ("phase_shift", self.phase_shift),
            ("gain", self.gain),
        ];
        for (name, value) in numeric {
            if !value.is_finite() {
                return Err(RuntimeError::invalid_beam(
                    &self.id,
                    format!("{} is not finite ({})", name, value),
                ));
            }
        }
        if self.gain <= 0.0 {
            return Err(RuntimeError::invalid_beam(&self.id, "gain must be > 0"));
        }
        for (key, value) in &self.metadata {
            if let Scalar::Number(n) = value {
                if !n.is_finite() {
                    return Err(RuntimeError::invalid_beam(
                        &self.id,
                        format!("metadata {} is not finite", key),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrips_as_plain_tag() {
        let json = serde_json::to_string(&EventKind::Rollback).unwrap();
        assert_eq!(json, "\"rollback\"");
        let other: EventKind = serde_json::from_str("\"dream_cycle\"").unwrap();
        assert_eq!(other, EventKind::Other("dream_cycle".to_string()));
    }

    #[test]
    fn test_beam_parses_with_defaults() {
        let beam: BeamEvent = serde_json::from_str(
            r#"{"id":"b0","event_type":"ingest","timestamp":1.0,"coherence":0.9,"entropy":0.1,
                "metadata":{"allow_collapse":false,"node_id":"n1","tick_time":3.5}}"#,
        )
        .unwrap();
        assert_eq!(beam.gain, 1.0);
        assert_eq!(beam.meta_bool("allow_collapse"), Some(false));
        assert_eq!(beam.node_id(), "n1");
        assert_eq!(beam.meta_f64("tick_time"), Some(3.5));
    }

    #[test]
    fn test_validate_rejects_nan_and_missing_id() {
        let ok = BeamEvent::new("b", 0.5, 0.1, 10.0);
        assert!(ok.validate().is_ok());

        let mut nan = ok.clone();
        nan.coherence = f64::NAN;
        assert!(matches!(nan.validate(), Err(RuntimeError::InvalidBeam { .. })));

        let mut inf = ok.clone();
        inf.entropy = f64::INFINITY;
        assert!(inf.validate().is_err());

        let empty = BeamEvent::new("  ", 0.5, 0.1, 10.0);
        assert!(empty.validate().is_err());

        let bad_meta = ok.clone().with_meta("tick_time", f64::NAN);
        assert!(bad_meta.validate().is_err());
    }

    #[test]
    fn test_validate_allows_out_of_range_coherence() {
        // clamped by the field store, not rejected
        let beam = BeamEvent::new("b", 1.7, -0.3, 10.0);
        assert!(beam.validate().is_ok());
    }

    #[test]
    fn test_non_positive_gain_rejected() {
        let mut beam = BeamEvent::new("b", 0.5, 0.1, 10.0);
        beam.gain = 0.0;
        assert!(beam.validate().is_err());
    }
}
