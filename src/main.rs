use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use rand::Rng;
use serde_json::json;
use tokio::time::{sleep, Duration};

use coherence_runtime::clock::{self, Clock};
use coherence_runtime::config::RuntimeConfig;
use coherence_runtime::error::RuntimeError;
use coherence_runtime::events::BeamEvent;
use coherence_runtime::ledger::{read_entries_strict, LedgerEntry};
use coherence_runtime::logging::{log, obj, v_str, Domain, Level};
use coherence_runtime::replay::{Replay, ReplaySource};
use coherence_runtime::runtime::{shutdown_signal, Runtime};
use coherence_runtime::telemetry::TelemetryDb;

const EXIT_NOT_FOUND: u8 = 1;
const EXIT_MALFORMED: u8 = 2;
const EXIT_FAILURE: u8 = 3;

fn print_usage() {
    eprintln!("Usage: coherence-runtime <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  run                                   Start the engine with a demo beam generator");
    eprintln!("  replay --source <path|db> [--speed s] Replay committed states");
    eprintln!("  telemetry --path <path> [--live] [--summary]");
    eprintln!("                                        Inspect a ledger or telemetry DB");
    eprintln!();
    eprintln!("Exit codes: 0 ok, 1 ledger not found, 2 malformed record or usage, 3 other failure.");
    eprintln!("Configuration is read from the environment (LEDGER_PATH, TELEMETRY_DB, PEER_URL, WS_ADDR, ...).");
}

/// Value following `--name`, or `--name=value`.
fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == name {
            return iter.next().cloned();
        }
        if let Some(v) = arg.strip_prefix(&prefix) {
            return Some(v.to_string());
        }
    }
    None
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<RuntimeError>() {
        Some(RuntimeError::LedgerNotFound(_)) => EXIT_NOT_FOUND,
        Some(RuntimeError::MalformedRecord { .. }) => EXIT_MALFORMED,
        _ => EXIT_FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::from(EXIT_MALFORMED);
    }
    let rest = &args[2..];

    let result = match args[1].as_str() {
        "run" => cmd_run().await,
        "replay" => match flag_value(rest, "--source") {
            Some(source) => {
                let speed = match flag_value(rest, "--speed").map(|s| s.parse::<f64>()) {
                    None => Ok(0.5),
                    Some(Ok(s)) => Ok(s),
                    Some(Err(_)) => Err(()),
                };
                match speed {
                    Ok(speed) => cmd_replay(Path::new(&source), speed).await,
                    Err(()) => {
                        eprintln!("--speed must be a number of seconds");
                        return ExitCode::from(EXIT_MALFORMED);
                    }
                }
            }
            None => {
                eprintln!("replay requires --source <path|db>");
                return ExitCode::from(EXIT_MALFORMED);
            }
        },
        "telemetry" => match flag_value(rest, "--path") {
            Some(path) => cmd_telemetry(Path::new(&path), has_flag(rest, "--live"), has_flag(rest, "--summary")).await,
            None => {
                eprintln!("telemetry requires --path <path>");
                return ExitCode::from(EXIT_MALFORMED);
            }
        },
        "-h" | "--help" | "help" => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            return ExitCode::from(EXIT_MALFORMED);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

// =============================================================================
// run
// =============================================================================

/// Noisy beam around a slowly drifting coherence, with the occasional
/// incoherent burst so repairs show up in a demo.
fn demo_beam(seq: u64, ts: f64) -> BeamEvent {
    let mut rng = rand::thread_rng();
    let base = 0.9 + 0.04 * (seq as f64 / 20.0).sin();
    let burst = rng.gen_bool(0.05);
    let coherence = if burst { rng.gen_range(0.3..0.6) } else { base + rng.gen_range(-0.03..0.03) };
    let entropy = if burst { rng.gen_range(0.4..0.8) } else { rng.gen_range(0.02..0.12) };
    BeamEvent::new(&format!("demo-{}", seq), coherence, entropy, ts)
        .with_source("demo")
        .with_meta("node_id", format!("node-{}", seq % 4).as_str())
}

async fn cmd_run() -> Result<()> {
    let cfg = RuntimeConfig::from_env();
    let clock = clock::system();
    let tick_interval = cfg.tick_interval;
    let demo_ticks = cfg.demo_ticks;
    let mut rt = Runtime::new(cfg, clock.clone())?;
    rt.start_background().await?;

    let mut interval = tokio::time::interval(tick_interval);
    let stop = shutdown_signal();
    tokio::pin!(stop);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                seq += 1;
                let beam = demo_beam(seq, clock.now());
                if let Err(err) = rt.publish(&beam) {
                    log(Level::Warn, Domain::System, "demo_beam_rejected", obj(&[("error", v_str(&err.to_string()))]));
                }
                for result in rt.pump() {
                    match result {
                        Ok(snap) => println!("{}", snap.frame()),
                        Err(err @ RuntimeError::LedgerWrite(_)) => {
                            rt.shutdown(Duration::from_secs(2)).await;
                            return Err(err.into());
                        }
                        Err(err) => log(Level::Warn, Domain::Cycle, "tick_failed", obj(&[("error", v_str(&err.to_string()))])),
                    }
                }
                if demo_ticks > 0 && seq >= demo_ticks {
                    break;
                }
            }
            _ = &mut stop => break,
        }
    }

    rt.shutdown(Duration::from_secs(2)).await;
    Ok(())
}

// =============================================================================
// replay
// =============================================================================

async fn cmd_replay(path: &Path, speed: f64) -> Result<()> {
    let source = ReplaySource::detect(path);
    let replay = Replay::load(&source)?;
    let frames = replay
        .run(speed, |frame| {
            println!("{}", frame.to_json());
            Ok(())
        })
        .await?;
    log(
        Level::Info,
        Domain::Telemetry,
        "replay_finished",
        obj(&[("source", v_str(&path.to_string_lossy())), ("frames", json!(frames))]),
    );
    Ok(())
}

// =============================================================================
// telemetry
// =============================================================================

fn load_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Err(RuntimeError::LedgerNotFound(path.to_path_buf()).into());
    }
    Ok(match ReplaySource::detect(path) {
        ReplaySource::Telemetry(p) => TelemetryDb::open(&p.to_string_lossy())?.all()?,
        ReplaySource::Ledger(p) => read_entries_strict(&p)?,
    })
}

fn print_summary(entries: &[LedgerEntry]) -> Result<()> {
    let mut db = TelemetryDb::in_memory()?;
    for e in entries {
        let session = e.session_id.clone().unwrap_or_default();
        db.ingest(e, &session)?;
    }
    let summary = db.summary()?;
    let trend = db.trend(20)?;
    let phi_trend = db.phi_trend(100)?;
    let coupling = db.resonance_coupling(100)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "entries": entries.len(),
            "summary": summary,
            "trend": trend,
            "phi_trend": phi_trend,
            "resonance_coupling": coupling,
        }))?
    );
    Ok(())
}

async fn cmd_telemetry(path: &Path, live: bool, summary: bool) -> Result<()> {
    let entries = load_entries(path)?;
    if summary {
        print_summary(&entries)?;
    } else {
        for e in &entries {
            println!("{}", serde_json::to_string(e)?);
        }
    }
    if !live {
        return Ok(());
    }

    let path: PathBuf = path.to_path_buf();
    let mut seen = entries.len();
    let stop = shutdown_signal();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = sleep(Duration::from_secs(1)) => {
                let entries = load_entries(&path)?;
                if entries.len() < seen {
                    return Err(anyhow!("{} shrank from {} to {} records", path.display(), seen, entries.len()));
                }
                for e in &entries[seen..] {
                    if summary {
                        println!(
                            "{}",
                            json!({"id": e.id, "status": e.status.as_str(), "C": e.tensor.coherence, "C_total": e.c_total})
                        );
                    } else {
                        println!("{}", serde_json::to_string(e)?);
                    }
                }
                seen = entries.len();
            }
            _ = &mut stop => break,
        }
    }
    log(Level::Info, Domain::Telemetry, "live_stopped", obj(&[("records", json!(seen))]));
    Ok(())
}
