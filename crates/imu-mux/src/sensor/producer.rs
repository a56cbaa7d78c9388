//! # Sensor Producer
//!
//! Reads IMU lines on a dedicated thread and enqueues encoded records onto
//! the stream queues. The producer never touches scheduling state; its only
//! link to the dispatcher is the set of [`StreamHandle`]s it was given.
//!
//! Routing:
//! - a `both` stream receives both records of every reading, accel first
//! - otherwise ACCEL records go to `accel` and GYRO records go to `gyro`
//!
//! A route whose stream has been torn down (or whose mux is shutting down)
//! is dropped. The producer exits when it is asked to stop, when input ends,
//! or when no routes remain.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::record::{SensorKind, StreamTag};
use crate::scheduler::StreamHandle;
use crate::sensor::imu::ImuReading;

/// Handles the producer feeds, keyed by what they carry.
#[derive(Debug, Clone, Default)]
pub struct SampleRoutes {
    accel: Option<StreamHandle>,
    gyro: Option<StreamHandle>,
    both: Option<StreamHandle>,
}

impl SampleRoutes {
    /// Picks routes out of `handles` by tag. Unrecognized tags are ignored.
    pub fn from_handles(handles: &[StreamHandle]) -> Self {
        let mut routes = Self::default();
        for handle in handles {
            match StreamTag::parse(handle.tag()) {
                Ok(StreamTag::Accel) => routes.accel = Some(handle.clone()),
                Ok(StreamTag::Gyro) => routes.gyro = Some(handle.clone()),
                Ok(StreamTag::Both) => routes.both = Some(handle.clone()),
                Err(_) => debug!(tag = handle.tag(), "no sensor route for stream"),
            }
        }
        routes
    }

    pub fn is_empty(&self) -> bool {
        self.accel.is_none() && self.gyro.is_none() && self.both.is_none()
    }

    fn slot(&mut self, kind: SensorKind) -> &mut Option<StreamHandle> {
        if self.both.is_some() {
            return &mut self.both;
        }
        match kind {
            SensorKind::Accel => &mut self.accel,
            SensorKind::Gyro => &mut self.gyro,
        }
    }
}

/// Live producer counters, shared with the thread that owns the reader.
#[derive(Debug, Default)]
pub struct ProducerCounters {
    lines: AtomicU64,
    samples_enqueued: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
}

impl ProducerCounters {
    pub fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            lines: self.lines.load(Ordering::Relaxed),
            samples_enqueued: self.samples_enqueued.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Non-blank input lines read.
    pub lines: u64,
    pub samples_enqueued: u64,
    /// Lines that were not six decimal fields.
    pub malformed: u64,
    /// Records refused by a queue (full, closed or torn down).
    pub rejected: u64,
}

fn enqueue_sample(
    routes: &mut SampleRoutes,
    kind: SensorKind,
    record: Bytes,
    counters: &ProducerCounters,
) {
    let slot = routes.slot(kind);
    let Some(handle) = slot.as_ref() else {
        return;
    };
    match handle.enqueue(record) {
        Ok(()) => {
            counters.samples_enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Err(MuxError::QueueFull(_)) => {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(stream = handle.tag(), error = %e, "dropping sensor route");
            *slot = None;
        }
    }
}

/// Reads `reader` to completion on the calling thread.
///
/// Returns when `stop` is set, input ends, input fails, or every route has
/// been dropped.
pub fn run_producer<R: BufRead>(
    mut reader: R,
    mut routes: SampleRoutes,
    stop: &AtomicBool,
    counters: &ProducerCounters,
) -> ProducerStats {
    let mut buf = Vec::with_capacity(128);

    while !stop.load(Ordering::Acquire) {
        if routes.is_empty() {
            info!("all sensor routes closed, producer stopping");
            break;
        }

        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                debug!("sensor input ended");
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "sensor read failed");
                break;
            }
        }

        // Serial devices emit garbage bytes on reset.
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        counters.lines.fetch_add(1, Ordering::Relaxed);

        let reading = match ImuReading::parse_line(&line) {
            Ok(reading) => reading,
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "skipping sensor line");
                continue;
            }
        };

        for sample in reading.samples() {
            enqueue_sample(&mut routes, sample.kind, sample.encode(), counters);
        }
    }

    counters.snapshot()
}

/// Producer thread handle.
pub struct SensorProducer {
    stop: Arc<AtomicBool>,
    counters: Arc<ProducerCounters>,
    done_rx: Receiver<ProducerStats>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SensorProducer {
    pub fn spawn<R: BufRead + Send + 'static>(
        reader: R,
        routes: SampleRoutes,
    ) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(ProducerCounters::default());
        let (done_tx, done_rx) = bounded(1);

        let stop_clone = stop.clone();
        let counters_clone = counters.clone();
        let worker = thread::Builder::new()
            .name("imu-producer".into())
            .spawn(move || {
                let stats = run_producer(reader, routes, &stop_clone, &counters_clone);
                let _ = done_tx.send(stats);
            })
            .context("failed to spawn sensor producer")?;

        Ok(Self {
            stop,
            counters,
            done_rx,
            worker: Some(worker),
        })
    }

    /// Asks the thread to stop after the line it is reading.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> ProducerStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Waits up to `timeout` for the thread to finish on its own.
    pub fn wait(&mut self, timeout: Duration) -> Option<ProducerStats> {
        self.worker.as_ref()?;
        let stats = self.done_rx.recv_timeout(timeout).ok()?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Some(stats)
    }

    /// Stops the thread and joins it within `grace`.
    ///
    /// A thread still blocked in a read after `grace` is detached; it exits
    /// on its next line or when the input closes.
    pub fn shutdown(&mut self, grace: Duration) -> ProducerStats {
        self.stop();
        let Some(worker) = self.worker.take() else {
            return self.stats();
        };
        match self.done_rx.recv_timeout(grace) {
            Ok(stats) => {
                let _ = worker.join();
                stats
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "sensor producer still blocked on input, detaching"
                );
                self.stats()
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The thread panicked before reporting.
                let _ = worker.join();
                self.stats()
            }
        }
    }
}

impl Drop for SensorProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressurePolicy, DuplicateTagPolicy, QueueConfig};
    use crate::scheduler::StreamRegistry;
    use quanta::Clock;
    use std::io::Cursor;

    fn registry(tags: &[&str], capacity: usize) -> StreamRegistry {
        let (clock, _) = Clock::mock();
        let queue = QueueConfig {
            capacity,
            backpressure: BackpressurePolicy::Drop,
        };
        let mut reg = StreamRegistry::new(clock, queue, DuplicateTagPolicy::Reject);
        for tag in tags {
            reg.register(tag, 1).unwrap();
        }
        reg
    }

    fn routes(reg: &StreamRegistry) -> SampleRoutes {
        let handles: Vec<StreamHandle> = reg
            .ids()
            .into_iter()
            .map(|id| reg.handle(id).unwrap())
            .collect();
        SampleRoutes::from_handles(&handles)
    }

    fn drain(reg: &StreamRegistry, tag: &str) -> Vec<String> {
        let id = reg.id_for_tag(tag).unwrap();
        std::iter::from_fn(|| reg.dequeue(id).ok())
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    const INPUT: &str = "1.000,2.000,3.000,0.100,0.200,0.300\n\
                         garbage\n\
                         \n\
                         -1.500,0.000,9.810,0.000,0.000,-0.125\n";

    #[test]
    fn splits_readings_by_kind() {
        let reg = registry(&["accel", "gyro"], 16);
        let counters = ProducerCounters::default();
        let stats = run_producer(
            Cursor::new(INPUT),
            routes(&reg),
            &AtomicBool::new(false),
            &counters,
        );

        assert_eq!(
            stats,
            ProducerStats {
                lines: 3,
                samples_enqueued: 4,
                malformed: 1,
                rejected: 0,
            }
        );
        assert_eq!(
            drain(&reg, "accel"),
            vec!["ACCEL:1.000,2.000,3.000\n", "ACCEL:-1.500,0.000,9.810\n"]
        );
        assert_eq!(
            drain(&reg, "gyro"),
            vec!["GYRO:0.100,0.200,0.300\n", "GYRO:0.000,0.000,-0.125\n"]
        );
    }

    #[test]
    fn both_stream_interleaves_accel_first() {
        let reg = registry(&["both", "accel"], 16);
        let stats = run_producer(
            Cursor::new(INPUT),
            routes(&reg),
            &AtomicBool::new(false),
            &ProducerCounters::default(),
        );
        assert_eq!(stats.samples_enqueued, 4);
        let both = drain(&reg, "both");
        assert_eq!(both.len(), 4);
        assert!(both[0].starts_with("ACCEL:"));
        assert!(both[1].starts_with("GYRO:"));
        assert!(both[2].starts_with("ACCEL:"));
        assert!(drain(&reg, "accel").is_empty());
    }

    #[test]
    fn full_queue_counts_rejections() {
        let reg = registry(&["accel", "gyro"], 1);
        let stats = run_producer(
            Cursor::new(INPUT),
            routes(&reg),
            &AtomicBool::new(false),
            &ProducerCounters::default(),
        );
        assert_eq!(stats.samples_enqueued, 2);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn closed_intake_stops_producer() {
        let reg = registry(&["accel", "gyro"], 16);
        reg.close_intake();
        let input = INPUT.repeat(10);
        let stats = run_producer(
            Cursor::new(input),
            routes(&reg),
            &AtomicBool::new(false),
            &ProducerCounters::default(),
        );
        // First reading hits both closed routes, then the loop exits.
        assert_eq!(stats.lines, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.samples_enqueued, 0);
    }

    #[test]
    fn stop_flag_is_honored() {
        let reg = registry(&["accel", "gyro"], 16);
        let stats = run_producer(
            Cursor::new(INPUT),
            routes(&reg),
            &AtomicBool::new(true),
            &ProducerCounters::default(),
        );
        assert_eq!(stats, ProducerStats::default());
    }

    #[test]
    fn spawned_producer_reports_on_end_of_input() {
        let reg = registry(&["accel", "gyro"], 16);
        let mut producer = SensorProducer::spawn(Cursor::new(INPUT), routes(&reg)).unwrap();
        let stats = producer.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(stats.samples_enqueued, 4);
        assert!(producer.is_finished());
        assert_eq!(producer.shutdown(Duration::from_millis(10)), stats);
    }

    #[test]
    fn shutdown_detaches_blocked_reader() {
        struct Stalled(Receiver<()>);
        impl io::Read for Stalled {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                let _ = self.0.recv();
                Ok(0)
            }
        }

        let reg = registry(&["accel"], 16);
        let (release_tx, release_rx) = bounded::<()>(1);
        let mut producer =
            SensorProducer::spawn(io::BufReader::new(Stalled(release_rx)), routes(&reg)).unwrap();

        let stats = producer.shutdown(Duration::from_millis(20));
        assert_eq!(stats, ProducerStats::default());
        drop(release_tx);
    }
}
