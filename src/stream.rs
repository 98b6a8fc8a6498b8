//! WebSocket fan-out of field snapshots.
//!
//! `broadcast` is synchronous and never fails: a subscriber whose send
//! fails once is dropped. Socket subscribers sit behind a bounded channel,
//! so a slow client fails on a full queue instead of stalling the tick.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::RuntimeError;
use crate::logging::{log, log_subscriber_drop, obj, v_str, Domain, Level};

pub trait Subscriber: Send + Sync {
    fn send(&self, frame: &str) -> anyhow::Result<()>;
}

/// Bounded queue in front of a socket writer.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<String>,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn send(&self, frame: &str) -> anyhow::Result<()> {
        self.tx
            .try_send(frame.to_string())
            .map_err(|e| anyhow::anyhow!("queue rejected frame: {}", e))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<u64>,
}

pub struct WsStreamer {
    subscribers: Mutex<Vec<(u64, Box<dyn Subscriber>)>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl WsStreamer {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Box<dyn Subscriber>)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attach(&self, subscriber: Box<dyn Subscriber>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().push((id, subscriber));
        log(Level::Debug, Domain::Stream, "subscriber_attached", obj(&[("subscriber", json!(id))]));
        id
    }

    /// Attach a bounded channel subscriber and hand back its receiving end.
    pub fn channel(&self) -> (u64, mpsc::Receiver<String>) {
        let (sub, rx) = ChannelSubscriber::new(self.capacity);
        (self.attach(Box::new(sub)), rx)
    }

    pub fn detach(&self, id: u64) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        before != subs.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast(&self, frame: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut subs = self.lock();
        subs.retain(|(id, sub)| match sub.send(frame) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err) => {
                let err = RuntimeError::SubscriberFailure {
                    subscriber: *id,
                    reason: err.to_string(),
                };
                log_subscriber_drop(*id, &err.to_string());
                report.dropped.push(*id);
                false
            }
        });
        report
    }

    /// Accept WebSocket clients until shutdown. Each client gets every
    /// frame broadcast after it connects; inbound messages are ignored.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        log(
            Level::Info,
            Domain::Stream,
            "listening",
            obj(&[("addr", v_str(&addr.to_string()))]),
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let streamer = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = streamer.handle_client(stream).await {
                                    log(
                                        Level::Debug,
                                        Domain::Stream,
                                        "client_closed",
                                        obj(&[("peer", v_str(&peer.to_string())), ("error", v_str(&err.to_string()))]),
                                    );
                                }
                            });
                        }
                        Err(err) => log(
                            Level::Warn,
                            Domain::Stream,
                            "accept_failed",
                            obj(&[("error", v_str(&err.to_string()))]),
                        ),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }

    async fn handle_client(&self, stream: TcpStream) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();
        let (id, mut rx) = self.channel();

        let result = loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = write.send(Message::Text(frame)).await {
                            break Err(err.into());
                        }
                    }
                    // dropped by broadcast
                    None => break Ok(()),
                },
                incoming = read.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => break Ok(()),
                    Some(Err(err)) => break Err(err.into()),
                    Some(Ok(_)) => {}
                },
            }
        };
        self.detach(id);
        result
    }
}
