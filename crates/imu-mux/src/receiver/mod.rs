//! # Stream Receiver
//!
//! Receiving end of the transport. Every logical stream starts with a
//! handshake token naming its feed, followed by newline-delimited
//! `TAG:x,y,z` records. The receiver tallies records per kind, counts lines
//! that fail to decode (or that carry a kind the stream's tag does not
//! allow) as malformed, and logs per-stream message rates.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::record::{SensorKind, SensorSample, StreamTag};

/// Interval between per-stream rate logs.
pub const RATE_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Totals across every stream served by one receiver.
#[derive(Debug)]
pub struct ReceiverStats {
    accel: AtomicU64,
    gyro: AtomicU64,
    malformed: AtomicU64,
    streams_open: AtomicU64,
    streams_total: AtomicU64,
    started: Instant,
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self {
            accel: AtomicU64::new(0),
            gyro: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            streams_open: AtomicU64::new(0),
            streams_total: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn record(&self, kind: SensorKind) {
        match kind {
            SensorKind::Accel => self.accel.fetch_add(1, Ordering::Relaxed),
            SensorKind::Gyro => self.gyro.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            accel: self.accel.load(Ordering::Relaxed),
            gyro: self.gyro.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            streams_open: self.streams_open.load(Ordering::Relaxed),
            streams_total: self.streams_total.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverSnapshot {
    pub accel: u64,
    pub gyro: u64,
    pub malformed: u64,
    pub streams_open: u64,
    pub streams_total: u64,
    pub elapsed: Duration,
}

impl ReceiverSnapshot {
    pub fn accel_rate(&self) -> f64 {
        rate(self.accel, self.elapsed)
    }

    pub fn gyro_rate(&self) -> f64 {
        rate(self.gyro, self.elapsed)
    }
}

fn rate(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// What one stream delivered before it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServedStream {
    pub tag: StreamTag,
    pub accel: u64,
    pub gyro: u64,
    pub malformed: u64,
}

/// Reads one logical stream to its end.
///
/// Fails only when the handshake is missing or unknown. Read errors after
/// the handshake end the stream like a normal close.
pub fn serve_stream<R: BufRead>(
    reader: R,
    stats: &ReceiverStats,
) -> Result<ServedStream, MuxError> {
    serve_stream_with_interval(reader, stats, RATE_LOG_INTERVAL)
}

pub fn serve_stream_with_interval<R: BufRead>(
    mut reader: R,
    stats: &ReceiverStats,
    log_interval: Duration,
) -> Result<ServedStream, MuxError> {
    let mut line = String::new();
    let tag = match reader.read_line(&mut line) {
        Ok(0) => return Err(MuxError::MalformedRecord("missing handshake".into())),
        Ok(_) => StreamTag::parse(&line)?,
        Err(e) => {
            return Err(MuxError::MalformedRecord(format!(
                "handshake read failed: {}",
                e
            )));
        }
    };

    stats.streams_open.fetch_add(1, Ordering::Relaxed);
    stats.streams_total.fetch_add(1, Ordering::Relaxed);
    info!(%tag, "stream opened");

    let mut served = ServedStream {
        tag,
        accel: 0,
        gyro: 0,
        malformed: 0,
    };
    let started = Instant::now();
    let mut window_start = started;
    let mut window_count = 0u64;

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(%tag, error = %e, "stream read failed");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match SensorSample::parse(&line) {
            Ok(sample) if tag.accepts(sample.kind) => {
                stats.record(sample.kind);
                match sample.kind {
                    SensorKind::Accel => served.accel += 1,
                    SensorKind::Gyro => served.gyro += 1,
                }
                window_count += 1;
            }
            Ok(sample) => {
                served.malformed += 1;
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(%tag, kind = sample.kind.prefix(), "record kind not allowed on stream");
            }
            Err(e) => {
                served.malformed += 1;
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(%tag, error = %e, "bad record");
            }
        }

        let window = window_start.elapsed();
        if window >= log_interval {
            info!(
                %tag,
                msgs_per_sec = rate(window_count, window),
                "stream rate"
            );
            window_start = Instant::now();
            window_count = 0;
        }
    }

    stats.streams_open.fetch_sub(1, Ordering::Relaxed);
    info!(
        %tag,
        accel = served.accel,
        gyro = served.gyro,
        malformed = served.malformed,
        msgs_per_sec = rate(served.accel + served.gyro, started.elapsed()),
        "stream ended"
    );
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn counts_records_by_kind() {
        let stats = ReceiverStats::new();
        let input = "accel\nACCEL:0.000,0.000,9.810\nACCEL:0.100,0.000,9.810\n";
        let served = serve_stream(Cursor::new(input), &stats).unwrap();
        assert_eq!(
            served,
            ServedStream {
                tag: StreamTag::Accel,
                accel: 2,
                gyro: 0,
                malformed: 0,
            }
        );

        let snap = stats.snapshot();
        assert_eq!(snap.accel, 2);
        assert_eq!(snap.streams_open, 0);
        assert_eq!(snap.streams_total, 1);
    }

    #[test]
    fn wrong_kind_and_garbage_are_malformed() {
        let stats = ReceiverStats::new();
        let input = "gyro\n\
                     GYRO:1.000,2.000,3.000\n\
                     ACCEL:0.000,0.000,9.810\n\
                     GYRO:1.000,2.000\n\
                     \n\
                     GYRO:0.000,0.000,0.000";
        let served = serve_stream(Cursor::new(input), &stats).unwrap();
        assert_eq!(served.gyro, 2);
        assert_eq!(served.accel, 0);
        assert_eq!(served.malformed, 2);
        assert_eq!(stats.snapshot().malformed, 2);
    }

    #[test]
    fn both_stream_accepts_either_kind() {
        let stats = ReceiverStats::new();
        let input = "both\r\nACCEL:0.000,0.000,9.810\nGYRO:0.000,0.000,0.000\n";
        let served = serve_stream(Cursor::new(input), &stats).unwrap();
        assert_eq!(served.tag, StreamTag::Both);
        assert_eq!((served.accel, served.gyro, served.malformed), (1, 1, 0));
    }

    #[test]
    fn bad_handshake_is_rejected() {
        let stats = ReceiverStats::new();
        assert!(matches!(
            serve_stream(Cursor::new(""), &stats),
            Err(MuxError::MalformedRecord(_))
        ));
        assert!(matches!(
            serve_stream(Cursor::new("ACCEL:0.000,0.000,9.810\n"), &stats),
            Err(MuxError::MalformedRecord(_))
        ));
        assert_eq!(stats.snapshot().streams_total, 0);
    }

    #[test]
    fn rates_use_elapsed_time() {
        let snap = ReceiverSnapshot {
            accel: 500,
            gyro: 100,
            malformed: 0,
            streams_open: 0,
            streams_total: 2,
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(snap.accel_rate(), 100.0);
        assert_eq!(snap.gyro_rate(), 20.0);
        assert_eq!(rate(10, Duration::ZERO), 0.0);
    }
}
