//! Owns one engine and its collaborators, and supervises the background
//! tasks (peer gossip, convergence, WebSocket server).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bridge::ResonanceBridge;
use crate::bus::{BeamQueue, EventBus, PublishReport};
use crate::clock::SharedClock;
use crate::config::RuntimeConfig;
use crate::convergence::ConvergenceLoop;
use crate::cycle::{CycleEngine, CycleSnapshot};
use crate::error::Result;
use crate::events::{BeamEvent, EventKind};
use crate::ledger::Ledger;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::regulator::SetpointHandle;
use crate::stream::WsStreamer;
use crate::telemetry::TelemetryDb;

/// Named background tasks sharing one shutdown signal.
pub struct TaskSupervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn<F>(&mut self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log(Level::Info, Domain::System, "task_spawned", obj(&[("task", v_str(name))]));
        self.tasks.push((name.to_string(), tokio::spawn(fut)));
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal shutdown and wait up to `grace` for each task. Returns the
    /// names of tasks that had to be aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<String> {
        let _ = self.shutdown_tx.send(true);
        let mut aborted = Vec::new();
        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log(
                    Level::Warn,
                    Domain::System,
                    "task_failed",
                    obj(&[("task", v_str(&name)), ("error", v_str(&err.to_string()))]),
                ),
                Err(_) => {
                    handle.abort();
                    log(Level::Warn, Domain::System, "task_aborted", obj(&[("task", v_str(&name))]));
                    aborted.push(name);
                }
            }
        }
        aborted
    }
}

pub struct Runtime {
    cfg: RuntimeConfig,
    bus: Arc<EventBus>,
    queue: Arc<BeamQueue>,
    engine: Arc<Mutex<CycleEngine>>,
    ledger: Arc<Mutex<Ledger>>,
    telemetry: Arc<Mutex<TelemetryDb>>,
    streamer: Arc<WsStreamer>,
    setpoints: SetpointHandle,
    supervisor: TaskSupervisor,
}

impl Runtime {
    pub fn new(cfg: RuntimeConfig, clock: SharedClock) -> Result<Self> {
        let ledger = Arc::new(Mutex::new(Ledger::open(&cfg.ledger, &cfg.session_id, clock.clone())?));
        let telemetry = Arc::new(Mutex::new(TelemetryDb::open(&cfg.telemetry_db)?));
        let streamer = Arc::new(WsStreamer::new(cfg.stream.channel_capacity));
        let setpoints = SetpointHandle::new();
        let engine = CycleEngine::new(&cfg, clock, ledger.clone())
            .with_telemetry(telemetry.clone())
            .with_streamer(streamer.clone())
            .with_setpoints(setpoints.clone());

        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(BeamQueue::new());
        {
            let queue = queue.clone();
            bus.subscribe(EventKind::Ingest.as_str(), move |beam| {
                queue.push(beam.clone());
                Ok(())
            });
        }

        log(
            Level::Info,
            Domain::System,
            "runtime_ready",
            obj(&[
                ("session_id", v_str(&cfg.session_id)),
                ("ledger", v_str(&cfg.ledger.path.to_string_lossy())),
                ("telemetry_db", v_str(&cfg.telemetry_db)),
            ]),
        );

        Ok(Self {
            cfg,
            bus,
            queue,
            engine: Arc::new(Mutex::new(engine)),
            ledger,
            telemetry,
            streamer,
            setpoints,
            supervisor: TaskSupervisor::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn queue(&self) -> &Arc<BeamQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<Mutex<CycleEngine>> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<Mutex<Ledger>> {
        &self.ledger
    }

    pub fn telemetry(&self) -> &Arc<Mutex<TelemetryDb>> {
        &self.telemetry
    }

    pub fn streamer(&self) -> &Arc<WsStreamer> {
        &self.streamer
    }

    pub fn setpoints(&self) -> SetpointHandle {
        self.setpoints.clone()
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Publish on the bus. Invalid beams are refused here so the producer
    /// sees the error and nothing is queued.
    pub fn publish(&self, beam: &BeamEvent) -> Result<PublishReport> {
        beam.validate()?;
        Ok(self.bus.publish(beam))
    }

    /// One tick under the tick lock.
    pub fn tick(&self, beam: Option<BeamEvent>) -> Result<CycleSnapshot> {
        let mut engine = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        engine.run_cycle(beam)
    }

    /// Drain the queue, one tick per beam, in queue order.
    pub fn pump(&self) -> Vec<Result<CycleSnapshot>> {
        self.queue.drain().into_iter().map(|beam| self.tick(Some(beam))).collect()
    }

    /// Start whatever background tasks the config asks for. Convergence
    /// always runs; the bridge needs a peer, the server a listen address.
    pub async fn start_background(&mut self) -> anyhow::Result<()> {
        let convergence = ConvergenceLoop::new(
            &self.cfg.convergence,
            self.cfg.regulator.target_coherence,
            self.setpoints.clone(),
        );
        let shutdown = self.supervisor.subscribe();
        self.supervisor
            .spawn("convergence", convergence.run(self.ledger.clone(), shutdown));

        if let Some(peer) = ResonanceBridge::peer_from_config(&self.cfg.bridge)? {
            let bridge = ResonanceBridge::new(&self.cfg.bridge, peer, self.setpoints.clone(), self.cfg.phase_threshold);
            let shutdown = self.supervisor.subscribe();
            self.supervisor.spawn("bridge", bridge.run(self.ledger.clone(), shutdown));
        }

        if let Some(addr) = &self.cfg.stream.listen_addr {
            let addr: SocketAddr = addr.parse().with_context(|| format!("invalid WS_ADDR {}", addr))?;
            let listener = TcpListener::bind(addr).await?;
            let streamer = self.streamer.clone();
            let shutdown = self.supervisor.subscribe();
            self.supervisor.spawn("ws", async move {
                if let Err(err) = streamer.serve(listener, shutdown).await {
                    log(Level::Error, Domain::Stream, "server_failed", obj(&[("error", v_str(&err.to_string()))]));
                }
            });
        }
        Ok(())
    }

    pub async fn shutdown(&mut self, grace: Duration) {
        let aborted = self.supervisor.shutdown(grace).await;
        let entries = self.ledger.lock().map(|l| l.len()).unwrap_or_else(|e| e.into_inner().len());
        log(
            Level::Info,
            Domain::System,
            "runtime_stopped",
            obj(&[
                ("session_id", v_str(&self.cfg.session_id)),
                ("ledger_entries", json!(entries)),
                ("aborted", json!(aborted)),
            ]),
        );
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log(Level::Error, Domain::System, "signal_install_failed", obj(&[("error", v_str(&err.to_string()))]));
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log(Level::Info, Domain::System, "shutdown_requested", obj(&[("signal", v_str("ctrl_c"))])),
        _ = terminate => log(Level::Info, Domain::System, "shutdown_requested", obj(&[("signal", v_str("sigterm"))])),
    }
}
