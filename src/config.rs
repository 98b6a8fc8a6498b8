//! Runtime configuration.
//!
//! Every knob has a compiled default; `from_env` overrides from the
//! process environment. Tests build configs with `Default` and override
//! fields directly.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RegulatorConfig {
    pub target_coherence: f64,
    pub smoothing_factor: f64,
    pub gain: f64,
    pub damping: f64,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            target_coherence: 0.92,
            smoothing_factor: 0.25,
            gain: 0.5,
            damping: 0.8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// Learning rate applied to ΔΦ.
    pub alpha: f64,
    /// Self-entropy damping.
    pub beta: f64,
    pub epsilon: f64,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            alpha: 0.002,
            beta: 0.0015,
            epsilon: 1e-9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub index_path: Option<PathBuf>,
    pub fsync: bool,
    /// Commit threshold on C_total.
    pub sqi_threshold: f64,
    /// Records kept in memory; older history is read from the file.
    pub tail_entries: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ledger/morphic_ledger.jsonl"),
            index_path: None,
            fsync: false,
            sqi_threshold: 0.9,
            tail_entries: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Instability threshold on C_total; distinct from the ledger's.
    pub sqi_threshold: f64,
    pub psi_kappa_divergence: f64,
    pub temporal_flux_floor: f64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            sqi_threshold: 0.85,
            psi_kappa_divergence: 0.5,
            temporal_flux_floor: 10.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub node_id: String,
    pub peer_url: Option<String>,
    pub peer_ledger: Option<PathBuf>,
    pub sync_token: String,
    pub sync_interval: Duration,
    pub fetch_timeout: Duration,
    pub state_path: Option<PathBuf>,
    pub max_state_entries: usize,
    pub failure_threshold: u32,
    /// Sync intervals skipped while the circuit is open.
    pub cooldown_intervals: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_id: "RCR_CORE".to_string(),
            peer_url: None,
            peer_ledger: None,
            sync_token: "resonance".to_string(),
            sync_interval: Duration::from_secs_f64(3.0),
            fetch_timeout: Duration::from_millis(2000),
            state_path: None,
            max_state_entries: 500,
            failure_threshold: 5,
            cooldown_intervals: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceConfig {
    pub period: Duration,
    pub window: usize,
    pub std_threshold: f64,
    pub relax: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs_f64(10.0),
            window: 20,
            std_threshold: 0.05,
            relax: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub listen_addr: Option<String>,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub session_id: String,
    pub phase_threshold: f64,
    pub telemetry_db: String,
    pub tick_interval: Duration,
    pub demo_ticks: u64,
    pub regulator: RegulatorConfig,
    pub awareness: AwarenessConfig,
    pub ledger: LedgerConfig,
    pub repair: RepairConfig,
    pub bridge: BridgeConfig,
    pub convergence: ConvergenceConfig,
    pub stream: StreamConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_id: new_session_id(),
            phase_threshold: 0.05,
            telemetry_db: ":memory:".to_string(),
            tick_interval: Duration::from_millis(250),
            demo_ticks: 0,
            regulator: RegulatorConfig::default(),
            awareness: AwarenessConfig::default(),
            ledger: LedgerConfig::default(),
            repair: RepairConfig::default(),
            bridge: BridgeConfig::default(),
            convergence: ConvergenceConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

pub fn new_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("rcr-{}", &id[..8])
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Positive, finite seconds below 1e9 from `raw`, else `default`.
fn secs_or(raw: Option<String>, default: Duration) -> Duration {
    raw.and_then(|v| v.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0 && *s < 1e9)
        .map(|s| Duration::from_secs_f64(s.max(0.001)))
        .unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            session_id: std::env::var("SESSION_ID").unwrap_or(d.session_id),
            phase_threshold: env_f64("PHASE_THRESHOLD", d.phase_threshold),
            telemetry_db: std::env::var("TELEMETRY_DB").unwrap_or(d.telemetry_db),
            tick_interval: std::env::var("TICK_MS").ok().and_then(|v| v.parse().ok()).map(Duration::from_millis).unwrap_or(d.tick_interval),
            demo_ticks: std::env::var("DEMO_TICKS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.demo_ticks),
            regulator: RegulatorConfig {
                target_coherence: env_f64("TARGET_COHERENCE", d.regulator.target_coherence),
                smoothing_factor: env_f64("SMOOTHING_FACTOR", d.regulator.smoothing_factor),
                gain: env_f64("REGULATOR_GAIN", d.regulator.gain),
                damping: env_f64("REGULATOR_DAMPING", d.regulator.damping),
            },
            awareness: AwarenessConfig {
                alpha: env_f64("AWARENESS_ALPHA", d.awareness.alpha),
                beta: env_f64("AWARENESS_BETA", d.awareness.beta),
                epsilon: env_f64("EPSILON", d.awareness.epsilon),
            },
            ledger: LedgerConfig {
                path: std::env::var("LEDGER_PATH").map(PathBuf::from).unwrap_or(d.ledger.path),
                index_path: std::env::var("LEDGER_INDEX").ok().map(PathBuf::from),
                fsync: env_bool("LEDGER_FSYNC"),
                sqi_threshold: env_f64("SQI_THRESHOLD", d.ledger.sqi_threshold),
                tail_entries: std::env::var("LEDGER_TAIL").ok().and_then(|v| v.parse().ok()).unwrap_or(d.ledger.tail_entries),
            },
            repair: RepairConfig {
                sqi_threshold: env_f64("REPAIR_SQI_THRESHOLD", d.repair.sqi_threshold),
                psi_kappa_divergence: env_f64("PSI_KAPPA_DIVERGENCE", d.repair.psi_kappa_divergence),
                temporal_flux_floor: env_f64("TEMPORAL_FLUX_FLOOR", d.repair.temporal_flux_floor),
            },
            bridge: BridgeConfig {
                node_id: std::env::var("NODE_ID").unwrap_or(d.bridge.node_id),
                peer_url: std::env::var("PEER_URL").ok(),
                peer_ledger: std::env::var("PEER_LEDGER").ok().map(PathBuf::from),
                sync_token: std::env::var("SYNC_TOKEN").unwrap_or(d.bridge.sync_token),
                sync_interval: secs_or(std::env::var("SYNC_INTERVAL").ok(), d.bridge.sync_interval),
                fetch_timeout: std::env::var("PEER_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).map(Duration::from_millis).unwrap_or(d.bridge.fetch_timeout),
                state_path: std::env::var("PEER_STATE_PATH").ok().map(PathBuf::from),
                max_state_entries: std::env::var("MAX_STATE_ENTRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(d.bridge.max_state_entries),
                failure_threshold: std::env::var("PEER_FAILURE_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.bridge.failure_threshold),
                cooldown_intervals: d.bridge.cooldown_intervals,
            },
            convergence: ConvergenceConfig {
                period: secs_or(std::env::var("CONVERGENCE_SECS").ok(), d.convergence.period),
                window: std::env::var("CONVERGENCE_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(d.convergence.window),
                std_threshold: env_f64("CONVERGENCE_STD_TH", d.convergence.std_threshold),
                relax: env_f64("CONVERGENCE_RELAX", d.convergence.relax),
            },
            stream: StreamConfig {
                listen_addr: std::env::var("WS_ADDR").ok(),
                channel_capacity: std::env::var("WS_CHANNEL_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(d.stream.channel_capacity),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.regulator.target_coherence, 0.92);
        assert_eq!(cfg.regulator.smoothing_factor, 0.25);
        assert_eq!(cfg.regulator.gain, 0.5);
        assert_eq!(cfg.regulator.damping, 0.8);
        assert_eq!(cfg.awareness.alpha, 0.002);
        assert_eq!(cfg.awareness.beta, 0.0015);
        assert_eq!(cfg.ledger.sqi_threshold, 0.9);
        assert_eq!(cfg.repair.sqi_threshold, 0.85);
        assert_eq!(cfg.bridge.max_state_entries, 500);
        assert_eq!(cfg.bridge.fetch_timeout, Duration::from_secs(2));
        assert_eq!(cfg.phase_threshold, 0.05);
    }

    #[test]
    fn test_interval_parsing_rejects_non_finite() {
        let d = Duration::from_secs(3);
        assert_eq!(secs_or(Some("inf".into()), d), d);
        assert_eq!(secs_or(Some("NaN".into()), d), d);
        assert_eq!(secs_or(Some("-2".into()), d), d);
        assert_eq!(secs_or(Some("abc".into()), d), d);
        assert_eq!(secs_or(Some("1e300".into()), d), d);
        assert_eq!(secs_or(None, d), d);
        assert_eq!(secs_or(Some("0.5".into()), d), Duration::from_millis(500));
        assert_eq!(secs_or(Some("1e-9".into()), d), Duration::from_millis(1));
    }

    #[test]
    fn test_session_ids_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert!(a.starts_with("rcr-"));
        assert_ne!(a, b);
    }
}
