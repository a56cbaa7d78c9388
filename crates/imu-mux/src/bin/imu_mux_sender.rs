//! # IMU Mux Sender
//!
//! Reads IMU lines from a serial device (or a recording, or stdin), splits
//! them into ACCEL and GYRO records and multiplexes them onto one TCP
//! connection per stream, weighted so the accelerometer feed gets priority.
//!
//! ## Usage
//!
//! ```bash
//! # Serial device to a local receiver
//! imu-mux-sender --input /dev/ttyACM0 --connect 127.0.0.1:4433
//!
//! # Replay a recording with custom weights
//! imu-mux-sender -i capture.csv -f mux.toml
//!
//! # Pipe from another process
//! imu-capture | imu-mux-sender -i -
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use imu_mux::config::MuxConfig;
use imu_mux::net::transport::TcpSink;
use imu_mux::runtime::MuxRuntime;
use imu_mux::sensor::{SampleRoutes, SensorProducer};

const PRODUCER_GRACE: Duration = Duration::from_secs(1);

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

    let config = match &args.config {
        Some(path) => MuxConfig::from_file(path)?,
        None => MuxConfig::default(),
    };

    tracing::info!(
        connect = %args.connect,
        input = %args.input,
        streams = ?config
            .streams
            .iter()
            .map(|s| format!("{}={}", s.tag, s.weight))
            .collect::<Vec<_>>(),
        capacity = config.queue.capacity,
        backpressure = ?config.queue.backpressure,
        "imu-mux-sender starting"
    );

    // ── Input ───────────────────────────────────────────────────
    let reader: Box<dyn BufRead + Send> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.input)
            .with_context(|| format!("cannot open input '{}'", args.input))?;
        Box::new(BufReader::new(file))
    };

    // ── Mux runtime ─────────────────────────────────────────────
    let mut runtime = MuxRuntime::start(&config, TcpSink::new(args.connect))?;
    let routes = SampleRoutes::from_handles(runtime.handles());
    if routes.is_empty() {
        anyhow::bail!("no configured stream is named accel, gyro or both");
    }
    let mut producer = SensorProducer::spawn(reader, routes)?;

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

    // ── Main loop ───────────────────────────────────────────────
    let mut last_stats_log = std::time::Instant::now();
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        if producer.wait(Duration::from_millis(100)).is_some() {
            tracing::info!("input finished");
            break;
        }

        if last_stats_log.elapsed() >= stats_interval {
            let produced = producer.stats();
            for s in runtime.stats() {
                tracing::info!(
                    tag = %s.tag,
                    weight = s.weight,
                    sent = s.send_count,
                    queued = s.queued,
                    dropped = s.dropped,
                    "stream stats"
                );
            }
            tracing::info!(
                lines = produced.lines,
                enqueued = produced.samples_enqueued,
                malformed = produced.malformed,
                rejected = produced.rejected,
                "producer stats"
            );
            last_stats_log = std::time::Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    // Producer first so nothing new lands in the queues while they drain.
    let produced = producer.shutdown(PRODUCER_GRACE);
    let report = runtime.shutdown().unwrap_or_default();

    for s in &report.streams {
        tracing::info!(
            tag = %s.tag,
            sent = s.send_count,
            discarded = s.discarded,
            dropped = s.dropped,
            "stream summary"
        );
    }
    tracing::info!(
        lines = produced.lines,
        malformed = produced.malformed,
        total_sent = report.total_sent(),
        forced = report.forced,
        "imu-mux-sender stopped"
    );

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    connect: SocketAddr,
    input: String,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut connect: SocketAddr = "127.0.0.1:4433".parse()?;
    let mut input = String::from("/dev/ttyACM0");
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--connect" | "-c" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--connect requires a value"))?;
                connect = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid address '{}': {}", val, e))?;
            }
            "--input" | "-i" => {
                i += 1;
                input = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--input requires a value"))?
                    .clone();
            }
            "--config" | "-f" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?,
                ));
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

    Ok(Args {
        connect,
        input,
        config,
    })
}

fn print_help() {
    eprintln!(
        r#"imu-mux-sender — Weighted IMU stream multiplexer

USAGE:
  imu-mux-sender [OPTIONS]

OPTIONS:
  --connect, -c <addr>    Receiver address (default: 127.0.0.1:4433)
  --input, -i <path>      Sensor line source, '-' for stdin (default: /dev/ttyACM0)
  --config, -f <path>     TOML config with stream weights and queue policy
  --help, -h              Show this help

ENVIRONMENT VARIABLES:
  RUST_LOG       Log level filter (e.g. info, debug, imu_mux=trace)
"#
    );
}
