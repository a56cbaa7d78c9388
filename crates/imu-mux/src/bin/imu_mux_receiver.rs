//! # IMU Mux Receiver
//!
//! Accepts the sender's per-stream TCP connections, decodes the records on
//! each and logs message rates.
//!
//! ## Usage
//!
//! ```bash
//! imu-mux-receiver --bind 0.0.0.0:4433
//! ```

use std::io::BufReader;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use imu_mux::receiver::{ReceiverStats, serve_stream};

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    let listener = TcpListener::bind(args.bind)
        .with_context(|| format!("cannot bind {}", args.bind))?;
    listener.set_nonblocking(true)?;
    tracing::info!(bind = %args.bind, "imu-mux-receiver listening");

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    // ── Accept loop ─────────────────────────────────────────────
    let stats = Arc::new(ReceiverStats::new());
    let mut last_stats_log = std::time::Instant::now();
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((conn, peer)) => {
                // Accepted sockets inherit non-blocking mode on some platforms.
                conn.set_nonblocking(false)?;
                let stats = stats.clone();
                std::thread::Builder::new()
                    .name("imu-stream".into())
                    .spawn(move || {
                        if let Err(e) = serve_stream(BufReader::new(conn), &stats) {
                            tracing::warn!(%peer, error = %e, "stream rejected");
                        }
                    })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                break;
            }
        }

        // Periodic stats logging
        if last_stats_log.elapsed() >= stats_interval {
            let snap = stats.snapshot();
            tracing::info!(
                accel = snap.accel,
                gyro = snap.gyro,
                malformed = snap.malformed,
                streams = snap.streams_open,
                accel_rate = snap.accel_rate(),
                gyro_rate = snap.gyro_rate(),
                "receiver stats"
            );
            last_stats_log = std::time::Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    let snap = stats.snapshot();
    tracing::info!(
        accel = snap.accel,
        gyro = snap.gyro,
        malformed = snap.malformed,
        streams = snap.streams_total,
        "imu-mux-receiver stopped"
    );

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    bind: SocketAddr,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut bind: SocketAddr = "0.0.0.0:4433".parse()?;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--bind requires a value"))?;
                bind = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", val, e))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    if let Ok(val) = std::env::var("BIND_ADDR") {
        if !args.iter().any(|a| a == "--bind" || a == "-b") {
            bind = val.trim().parse()?;
        }
    }

    Ok(Args { bind })
}

fn print_help() {
    eprintln!(
        r#"imu-mux-receiver — Receiving end for imu-mux-sender

USAGE:
  imu-mux-receiver [OPTIONS]

OPTIONS:
  --bind, -b <addr>       TCP listen address (default: 0.0.0.0:4433)
  --help, -h              Show this help

ENVIRONMENT VARIABLES:
  BIND_ADDR      Listen address (fallback for --bind)
  RUST_LOG       Log level filter (e.g. info, debug, imu_mux=trace)
"#
    );
}
