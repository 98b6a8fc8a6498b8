//! In-process beam bus and the ordered ingest queue.
//!
//! `EventBus::publish` runs every matching handler synchronously on the
//! publisher's thread: first the handlers registered for the event's tag
//! (in registration order), then the wildcard handlers. A failing or
//! panicking handler is logged and skipped; publish itself never fails.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::events::BeamEvent;
use crate::logging::{log, obj, v_str, Domain, Level};

pub const WILDCARD: &str = "*";

pub type BeamHandler = Arc<dyn Fn(&BeamEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<String, Vec<(SubscriptionId, BeamHandler)>>,
    wildcard: Vec<(SubscriptionId, BeamHandler)>,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for an event tag, or for everything with `"*"`.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&BeamEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        let handler: BeamHandler = Arc::new(handler);
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if pattern == WILDCARD {
            reg.wildcard.push((id, handler));
        } else {
            reg.by_kind
                .entry(pattern.to_string())
                .or_default()
                .push((id, handler));
        }
        id
    }

    /// Returns false when nothing was registered under that id and pattern.
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> bool {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let list = if pattern == WILDCARD {
            &mut reg.wildcard
        } else {
            match reg.by_kind.get_mut(pattern) {
                Some(list) => list,
                None => return false,
            }
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        before != list.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.wildcard.len() + reg.by_kind.values().map(Vec::len).sum::<usize>()
    }

    pub fn publish(&self, event: &BeamEvent) -> PublishReport {
        // Snapshot handler lists so handlers may (un)subscribe while we dispatch.
        let handlers: Vec<(SubscriptionId, BeamHandler)> = {
            let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.by_kind
                .get(event.event_type.as_str())
                .into_iter()
                .flatten()
                .chain(reg.wildcard.iter())
                .cloned()
                .collect()
        };

        let mut report = PublishReport::default();
        for (id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("handler panicked".to_string()),
            };
            match failure {
                None => report.delivered += 1,
                Some(reason) => {
                    report.failed += 1;
                    log(
                        Level::Warn,
                        Domain::Bus,
                        "handler_failed",
                        obj(&[
                            ("subscription", json!(id.0)),
                            ("beam_id", v_str(&event.id)),
                            ("event_type", v_str(event.event_type.as_str())),
                            ("reason", v_str(&reason)),
                        ]),
                    );
                }
            }
        }
        report
    }
}

// =============================================================================
// Ingest queue
// =============================================================================

/// Wrapper for priority queue ordering (earliest first)
struct TimedBeam {
    seq: u64,
    beam: BeamEvent,
}

impl PartialEq for TimedBeam {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimedBeam {}

impl PartialOrd for TimedBeam {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedBeam {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest first)
        match other.beam.timestamp.total_cmp(&self.beam.timestamp) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Beams published outside a tick wait here until the engine drains them.
#[derive(Default)]
pub struct BeamQueue {
    heap: Mutex<BinaryHeap<TimedBeam>>,
    seq: AtomicU64,
}

impl BeamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, beam: BeamEvent) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TimedBeam { seq, beam });
    }

    pub fn pop(&self) -> Option<BeamEvent> {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .map(|t| t.beam)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain all queued beams in order
    pub fn drain(&self) -> Vec<BeamEvent> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(heap.len());
        while let Some(t) = heap.pop() {
            out.push(t.beam);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn beam(id: &str, kind: EventKind, ts: f64) -> BeamEvent {
        let mut b = BeamEvent::new(id, 0.9, 0.1, ts);
        b.event_type = kind;
        b
    }

    #[test]
    fn test_kind_handlers_run_before_wildcard_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.subscribe(WILDCARD, move |_| {
            o.lock().unwrap().push("wild");
            Ok(())
        });
        let o = order.clone();
        bus.subscribe("ingest", move |_| {
            o.lock().unwrap().push("ingest-1");
            Ok(())
        });
        let o = order.clone();
        bus.subscribe("ingest", move |_| {
            o.lock().unwrap().push("ingest-2");
            Ok(())
        });
        let o = order.clone();
        bus.subscribe("commit", move |_| {
            o.lock().unwrap().push("commit");
            Ok(())
        });

        let report = bus.publish(&beam("b1", EventKind::Ingest, 1.0));
        assert_eq!(report.delivered, 3);
        assert_eq!(*order.lock().unwrap(), vec!["ingest-1", "ingest-2", "wild"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        bus.subscribe("ingest", |_| Err(anyhow::anyhow!("boom")));
        bus.subscribe("ingest", |_| panic!("handler panic"));
        let h = hits.clone();
        bus.subscribe(WILDCARD, move |_| {
            h.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });

        let report = bus.publish(&beam("b1", EventKind::Ingest, 1.0));
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe("feedback", |_| Ok(()));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(!bus.unsubscribe("ingest", id));
        assert!(bus.unsubscribe("feedback", id));
        assert_eq!(bus.subscriber_count(), 0);
        let report = bus.publish(&beam("b1", EventKind::Feedback, 1.0));
        assert_eq!(report, PublishReport::default());
    }

    #[test]
    fn test_other_tags_reach_wildcard_only() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        bus.subscribe(WILDCARD, move |_| {
            h.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        bus.subscribe("ingest", |_| Err(anyhow::anyhow!("should not run")));
        let report = bus.publish(&beam("b1", EventKind::from("glyph"), 1.0));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_queue_orders_by_timestamp_then_arrival() {
        let q = BeamQueue::new();
        q.push(beam("late", EventKind::Ingest, 3.0));
        q.push(beam("first", EventKind::Ingest, 1.0));
        q.push(beam("second", EventKind::Ingest, 1.0));
        q.push(beam("mid", EventKind::Ingest, 2.0));

        let ids: Vec<String> = q.drain().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["first", "second", "mid", "late"]);
        assert!(q.is_empty());
    }
}
