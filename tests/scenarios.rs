//! End-to-end behaviour of the engine, driven through the public API.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coherence_runtime::bridge::{Peer, PeerState, ResonanceBridge, SyncPacket, SyncStatus};
use coherence_runtime::clock::ManualClock;
use coherence_runtime::config::{BridgeConfig, LedgerConfig, RegulatorConfig, RuntimeConfig};
use coherence_runtime::cycle::{CycleEngine, TickOutcome};
use coherence_runtime::events::BeamEvent;
use coherence_runtime::field::FieldStore;
use coherence_runtime::ledger::{read_entries, EntryKind, EntryStatus, Ledger};
use coherence_runtime::regulator::{MorphicRegulator, RegulationStatus};
use coherence_runtime::repair::RepairStatus;
use coherence_runtime::replay::{Replay, ReplaySource};
use coherence_runtime::stream::{Subscriber, WsStreamer};
use coherence_runtime::telemetry::TelemetryDb;
use coherence_runtime::tensor::FieldTensor;

const START: f64 = 1_700_000_500.0;

struct Harness {
    engine: CycleEngine,
    ledger: Arc<Mutex<Ledger>>,
    clock: Arc<ManualClock>,
    cfg: RuntimeConfig,
}

fn harness(dir: &Path) -> Harness {
    let clock = Arc::new(ManualClock::new(START));
    let cfg = RuntimeConfig {
        ledger: LedgerConfig { path: dir.join("morphic_ledger.jsonl"), ..Default::default() },
        ..Default::default()
    };
    let ledger = Arc::new(Mutex::new(Ledger::open(&cfg.ledger, &cfg.session_id, clock.clone()).unwrap()));
    let engine = CycleEngine::new(&cfg, clock.clone(), ledger.clone());
    Harness { engine, ledger, clock, cfg }
}

fn beam(id: &str, coherence: f64, entropy: f64) -> BeamEvent {
    BeamEvent::new(id, coherence, entropy, START)
}

#[test]
fn single_stable_beam() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    let snap = h.engine.run_cycle(Some(beam("b0", 0.92, 0.08))).unwrap();

    let ledger = h.ledger.lock().unwrap();
    assert_eq!(ledger.len(), 1);
    let entry = &ledger.entries()[0];
    assert_eq!(entry.status, EntryStatus::Committed);
    assert!((0.91..=0.93).contains(&entry.tensor.coherence));
    assert!((entry.c_total - 0.944).abs() < 1e-9);
    assert_eq!(snap.adjustment.status, RegulationStatus::Stabilized);
    assert!(snap.awareness.phi > 0.0);
}

#[test]
fn stable_to_unstable_transition_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());

    let mut tick3 = None;
    for i in 1..=3 {
        h.clock.advance(1.0);
        let snap = h.engine.run_cycle(Some(beam(&format!("b{}", i), 0.9, 0.1))).unwrap();
        assert_eq!(snap.entry.status, EntryStatus::Committed);
        assert_eq!(snap.repair.status, RepairStatus::Stable);
        tick3 = Some(snap);
    }
    let tick3 = tick3.unwrap();

    h.clock.advance(1.0);
    let snap = h.engine.run_cycle(Some(beam("b4", 0.5, 0.1))).unwrap();
    assert_eq!(snap.entry.status, EntryStatus::Pending);
    assert!(snap.entry.c_total < 0.85);
    assert_eq!(snap.repair.status, RepairStatus::Repaired);
    assert_eq!(snap.outcome, TickOutcome::Repaired);
    let adj = h.engine.regulator().last_adjustment().unwrap();
    assert_eq!(adj.status, RegulationStatus::Adjusting);

    // node set equals the one committed at tick 3
    assert_eq!(h.engine.field().snapshot().nodes, tick3.entry.morphic_nodes().unwrap());
    assert_eq!(h.engine.field().len(), 3);

    let ledger = h.ledger.lock().unwrap();
    let rolled: Vec<_> = ledger
        .entries()
        .iter()
        .filter(|e| e.status == EntryStatus::RolledBack)
        .collect();
    assert_eq!(rolled.len(), 1);
    assert_eq!(rolled[0].rollback_of(), Some(tick3.entry.id.as_str()));
    assert_eq!(rolled[0].supersedes(), Some(snap.entry.id.as_str()));
    assert_eq!(ledger.last_committed().unwrap().id, tick3.entry.id);
}

#[test]
fn veto_forces_repair() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    let first = h.engine.run_cycle(Some(beam("a", 0.92, 0.08))).unwrap();

    h.clock.advance(1.0);
    let vetoed = beam("v", 0.92, 0.08).with_meta("allow_collapse", false);
    let snap = h.engine.run_cycle(Some(vetoed)).unwrap();
    assert_eq!(snap.repair.status, RepairStatus::Repaired);

    let rollback = snap.rollback.as_ref().unwrap();
    assert!(rollback.meta.contains_key("veto_reason"));
    assert_eq!(rollback.rollback_of(), Some(first.entry.id.as_str()));

    // the vetoed tick's commit is superseded; only the first survives
    let ledger = h.ledger.lock().unwrap();
    assert_eq!(ledger.last_committed().unwrap().id, first.entry.id);
    assert_eq!(h.engine.field().len(), 1);
}

struct FixedPeer(PeerState);

#[async_trait]
impl Peer for FixedPeer {
    fn name(&self) -> &str {
        "fixed"
    }
    async fn fetch_state(&self) -> anyhow::Result<Option<PeerState>> {
        Ok(Some(self.0))
    }
    async fn push_state(&self, _: &SyncPacket) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn peer_sync_retargets_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    let peer = FixedPeer(PeerState { psi: 0.3, kappa: 0.2, t: 1.0, coherence: 0.88, phi: None });
    let mut bridge = ResonanceBridge::new(&BridgeConfig::default(), Arc::new(peer), h.engine.setpoints(), 0.05);

    assert_eq!(bridge.sync_from_peer().await, SyncStatus::Synced { target: 0.88 });
    let snap = h.engine.run_cycle(Some(beam("b0", 0.9, 0.1))).unwrap();
    assert_eq!(h.engine.regulator().target(), 0.88);
    assert_eq!(snap.adjustment.target, 0.88);
    assert_eq!(snap.entry.regulator_target(), Some(0.88));
}

#[tokio::test]
async fn replay_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    for i in 0..5 {
        h.clock.advance(1.0);
        h.engine.run_cycle(Some(beam(&format!("b{}", i), 0.92, 0.08))).unwrap();
    }
    let (n, last) = {
        let ledger = h.ledger.lock().unwrap();
        let n = ledger.entries().iter().filter(|e| e.is_field_commit()).count();
        (n, ledger.last_committed().unwrap().tensor)
    };
    assert_eq!(n, 5);

    let replay = Replay::load(&ReplaySource::detect(&h.cfg.ledger.path)).unwrap();
    let mut stamps = Vec::new();
    let count = replay
        .run(0.0, |f| {
            stamps.push(f.timestamp);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(count, n);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    let final_frame = replay.frames().last().unwrap();
    assert_eq!(
        serde_json::to_value(final_frame.tensor).unwrap(),
        serde_json::to_value(last).unwrap()
    );
}

struct Failing;
impl Subscriber for Failing {
    fn send(&self, _: &str) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("broken pipe"))
    }
}

struct Collecting(Arc<Mutex<Vec<String>>>);
impl Subscriber for Collecting {
    fn send(&self, frame: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(frame.to_string());
        Ok(())
    }
}

#[test]
fn failing_subscriber_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let streamer = Arc::new(WsStreamer::new(8));
    let bad = streamer.attach(Box::new(Failing));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let good = streamer.attach(Box::new(Collecting(seen.clone())));
    let mut engine = h.engine.with_streamer(streamer.clone());

    engine.run_cycle(Some(beam("b0", 0.92, 0.08))).unwrap();
    assert_eq!(streamer.len(), 1);
    assert!(!streamer.detach(bad));
    assert!(streamer.detach(good));

    let frames = seen.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(frame["type"], "field_state");
    assert!(frame.get("adjustment").is_some());
}

#[test]
fn one_primary_entry_per_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    let inputs = [
        Some(beam("a", 0.92, 0.08)),
        None,
        Some(beam("b", 0.4, 0.7)),
        Some(beam("a", 0.95, 0.05)),
        None,
    ];
    for input in inputs.iter().cloned() {
        h.clock.advance(0.5);
        h.engine.run_cycle(input).unwrap();
    }
    let entries = read_entries(&h.cfg.ledger.path).unwrap();
    let primary = entries.iter().filter(|e| e.kind == EntryKind::Commit).count();
    assert_eq!(primary, inputs.len());
    for e in entries.iter().filter(|e| e.status == EntryStatus::Committed) {
        assert!((0.0..=1.0).contains(&e.tensor.coherence));
    }
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn upsert_keeps_node_values_in_range() {
    let fs = FieldStore::new(Arc::new(ManualClock::new(START)));
    for (c, e) in [(1.7, -0.3), (-0.5, 2.0), (0.5, 0.5), (1.0, 0.0)] {
        fs.upsert_node(&beam("n", c, e)).unwrap();
        for node in fs.snapshot().nodes {
            assert!((0.0..=1.0).contains(&node.coherence));
            assert!((0.0..=1.0).contains(&node.entropy));
        }
    }
}

#[test]
fn telemetry_export_reimport_keeps_summary() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    for i in 0..4 {
        h.clock.advance(1.0);
        h.engine.run_cycle(Some(beam(&format!("b{}", i), 0.9 + i as f64 * 0.01, 0.1))).unwrap();
    }
    let mut db = TelemetryDb::in_memory().unwrap();
    for e in read_entries(&h.cfg.ledger.path).unwrap() {
        db.ingest(&e, &h.cfg.session_id).unwrap();
    }
    let out = dir.path().join("telemetry.json");
    db.export_json(&out).unwrap();

    let mut again = TelemetryDb::open(&dir.path().join("again.db").to_string_lossy()).unwrap();
    assert_eq!(again.import_json(&out, &h.cfg.session_id).unwrap(), db.len().unwrap());
    assert_eq!(again.summary().unwrap(), db.summary().unwrap());
}

#[test]
fn regulate_is_idempotent_when_stabilized() {
    let cfg = RegulatorConfig::default();
    let mut reg = MorphicRegulator::new(&cfg);
    let fs = FieldStore::new(Arc::new(ManualClock::new(START)));
    fs.upsert_node(&beam("n", 0.915, 0.1)).unwrap();
    let snap = fs.snapshot();

    let first = reg.regulate(snap.tensor, &snap.nodes, START);
    assert_eq!(first.status, RegulationStatus::Stabilized);
    let second = reg.regulate(snap.tensor, &snap.nodes, START + 1.0);
    assert!((second.smoothed_coherence - first.smoothed_coherence).abs() <= cfg.smoothing_factor * 0.02);
}

#[test]
fn coherence_at_target_needs_no_correction() {
    let mut reg = MorphicRegulator::new(&RegulatorConfig::default());
    let fs = FieldStore::new(Arc::new(ManualClock::new(START)));
    fs.upsert_node(&beam("n", 0.92, 0.1)).unwrap();
    let snap = fs.snapshot();
    let adj = reg.regulate(snap.tensor, &snap.nodes, START);
    assert!(adj.corrective.abs() < 1e-9);
}

#[test]
fn empty_field_tick_reports_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());
    let snap = h.engine.run_cycle(None).unwrap();
    assert_eq!(snap.tensor, FieldTensor::default());
    assert_eq!(snap.adjustment.status, RegulationStatus::NoData);
    assert_eq!(snap.outcome, TickOutcome::Stable);
}

#[test]
fn reopened_ledger_restores_from_previous_session() {
    let dir = tempfile::tempdir().unwrap();
    let first_id = {
        let mut h = harness(dir.path());
        h.engine.run_cycle(Some(beam("a", 0.92, 0.08))).unwrap().entry.id
    };
    let mut h = harness(dir.path());
    assert_eq!(h.ledger.lock().unwrap().last_committed().unwrap().id, first_id);

    h.clock.advance(1.0);
    let snap = h.engine.run_cycle(Some(beam("x", 0.2, 0.9))).unwrap();
    assert_eq!(snap.repair.status, RepairStatus::Repaired);
    assert_eq!(snap.repair.restored_entry_id.as_deref(), Some(first_id.as_str()));
    let ids: Vec<String> = h.engine.field().snapshot().nodes.into_iter().map(|n| n.node_id).collect();
    assert_eq!(ids, vec!["a".to_string()]);
}


#[test]
fn long_run_keeps_ledger_memory_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let cfg = RuntimeConfig {
        ledger: LedgerConfig { path: dir.path().join("morphic_ledger.jsonl"), tail_entries: 16, ..Default::default() },
        ..Default::default()
    };
    let ledger = Arc::new(Mutex::new(Ledger::open(&cfg.ledger, &cfg.session_id, clock.clone()).unwrap()));
    let mut engine = CycleEngine::new(&cfg, clock.clone(), ledger.clone());

    for i in 0..300u32 {
        clock.advance(0.5);
        let b = if i % 50 == 25 {
            beam(&format!("b{}", i), 0.4, 0.7)
        } else {
            beam(&format!("b{}", i), 0.93, 0.05)
        };
        engine
            .run_cycle(Some(b.with_meta("node_id", format!("node-{}", i % 10).as_str())))
            .unwrap();
    }

    let ledger = ledger.lock().unwrap();
    assert!(ledger.entries().len() <= 16);
    assert!(ledger.len() >= 300);
    assert_eq!(read_entries(&cfg.ledger.path).unwrap().len(), ledger.len());
    let last = ledger.last_committed().unwrap();
    assert_eq!(last.kind, EntryKind::Commit);
    assert_eq!(last.status, EntryStatus::Committed);
}
