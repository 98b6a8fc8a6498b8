//! Ledger record types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::field::FieldNode;
use crate::tensor::LedgerTensor;

pub const W_SYMBOLIC: f64 = 0.3;
pub const W_PHOTONIC: f64 = 0.4;
pub const W_HOLOGRAPHIC: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Committed,
    Pending,
    RolledBack,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Committed => "committed",
            EntryStatus::Pending => "pending",
            EntryStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    Commit,
    Rollback,
    Feedback,
    PeerSync,
    Link,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Commit => "commit",
            EntryKind::Rollback => "rollback",
            EntryKind::Feedback => "feedback",
            EntryKind::PeerSync => "peer_sync",
            EntryKind::Link => "link",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLink {
    pub node_id: String,
    pub relation: String,
}

/// One line of the JSONL ledger. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub timestamp: f64,
    pub observer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub tensor: LedgerTensor,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub status: EntryStatus,
    #[serde(default)]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<EntryLink>,
    #[serde(rename = "C_total", default)]
    pub c_total: f64,
}

impl LedgerEntry {
    /// A committed field commit, the only kind a rollback may target.
    pub fn is_field_commit(&self) -> bool {
        self.status == EntryStatus::Committed && self.kind == EntryKind::Commit
    }

    pub fn has_valid_tensor(&self) -> bool {
        self.tensor.is_valid() && (0.0..=1.0).contains(&self.tensor.coherence)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn rollback_of(&self) -> Option<&str> {
        self.meta_str("rollback_of")
    }

    pub fn supersedes(&self) -> Option<&str> {
        self.meta_str("supersedes")
    }

    /// Node list stored under `meta.morphic_state.nodes`, if any.
    pub fn morphic_nodes(&self) -> Option<Vec<FieldNode>> {
        let nodes = self.meta.get("morphic_state")?.get("nodes")?;
        serde_json::from_value(nodes.clone()).ok()
    }

    /// Regulator target recorded with this entry.
    pub fn regulator_target(&self) -> Option<f64> {
        self.meta
            .get("regulator")
            .and_then(|r| r.get("target_coherence"))
            .and_then(Value::as_f64)
    }

    pub fn phi(&self) -> Option<f64> {
        self.meta
            .get("awareness")
            .and_then(|a| a.get("phi"))
            .and_then(Value::as_f64)
    }
}

/// Sub-component coherence scores feeding the commit decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoherenceScores {
    pub symbolic: f64,
    pub photonic: f64,
    pub holographic: f64,
}

impl CoherenceScores {
    pub fn total(&self) -> f64 {
        W_SYMBOLIC * self.symbolic + W_PHOTONIC * self.photonic + W_HOLOGRAPHIC * self.holographic
    }
}

/// Everything the ledger needs to build one record.
#[derive(Debug, Clone)]
pub struct CommitInput {
    pub observer: String,
    pub kind: EntryKind,
    pub tensor: LedgerTensor,
    pub meta: Map<String, Value>,
    pub link: Option<EntryLink>,
    pub scores: Option<CoherenceScores>,
    /// Forced status; `None` applies the C_total threshold rule.
    pub status: Option<EntryStatus>,
}

impl CommitInput {
    pub fn commit(observer: &str, tensor: LedgerTensor, scores: CoherenceScores, meta: Map<String, Value>) -> Self {
        Self {
            observer: observer.to_string(),
            kind: EntryKind::Commit,
            tensor,
            meta,
            link: None,
            scores: Some(scores),
            status: None,
        }
    }

    pub fn record(observer: &str, kind: EntryKind, tensor: LedgerTensor, meta: Map<String, Value>) -> Self {
        Self {
            observer: observer.to_string(),
            kind,
            tensor,
            meta,
            link: None,
            scores: None,
            status: Some(EntryStatus::Committed),
        }
    }

    pub fn with_link(mut self, node_id: &str, relation: &str) -> Self {
        self.link = Some(EntryLink {
            node_id: node_id.to_string(),
            relation: relation.to_string(),
        });
        self
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Hex SHA-256 of a JSON value's canonical string.
pub fn digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
