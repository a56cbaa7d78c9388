use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use quanta::{Clock, Instant};
use tracing::{debug, info};

use crate::config::{DispatchConfig, MuxConfig};
use crate::dispatch::{DispatchOutcome, DispatchReport, Dispatcher};
use crate::net::interface::StreamSink;
use crate::scheduler::{StreamHandle, StreamId, StreamSnapshot};

/// Control messages for the dispatch worker (infrequent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMessage {
    Unregister(StreamId),
    Shutdown,
}

/// Thread-safe handle to the dispatch worker.
///
/// Owns a background thread running the [`Dispatcher`] loop. The configured
/// streams are registered (and opened on the sink) before the thread starts,
/// so the worker is the only writer of scheduling state from then on.
///
/// Producers feed the worker through [`StreamHandle`]s; the control path
/// (teardown, shutdown) is a bounded crossbeam channel. Dropping the runtime
/// triggers a graceful shutdown.
pub struct MuxRuntime {
    handles: Vec<StreamHandle>,
    control_tx: Sender<ControlMessage>,
    intake_closed: Arc<AtomicBool>,
    stats: Arc<Mutex<Vec<StreamSnapshot>>>,
    worker: Option<thread::JoinHandle<DispatchReport>>,
    report: Option<DispatchReport>,
}

impl MuxRuntime {
    /// Starts a runtime on the wall clock.
    pub fn start<S: StreamSink + 'static>(config: &MuxConfig, sink: S) -> anyhow::Result<Self> {
        Self::start_with_clock(config, sink, Clock::new())
    }

    /// Starts a runtime whose scheduling decisions read `clock`.
    pub fn start_with_clock<S: StreamSink + 'static>(
        config: &MuxConfig,
        sink: S,
        clock: Clock,
    ) -> anyhow::Result<Self> {
        let mut dispatcher = Dispatcher::from_config(config, sink, clock);
        for stream in &config.streams {
            dispatcher.register(&stream.tag, stream.weight)?;
        }

        // Replaced duplicates are already gone; hand out what is live.
        let handles = dispatcher
            .registry()
            .ids()
            .into_iter()
            .map(|id| dispatcher.handle(id))
            .collect::<Result<Vec<_>, _>>()?;

        let (control_tx, control_rx) = bounded(64);
        let intake_closed = dispatcher.registry().intake_flag();
        let stats = Arc::new(Mutex::new(dispatcher.registry().snapshot()));
        let stats_clone = stats.clone();
        let dispatch_config = config.dispatch;

        let worker = thread::Builder::new()
            .name("imu-mux-dispatch".into())
            .spawn(move || runtime_worker(dispatcher, control_rx, stats_clone, dispatch_config))
            .context("failed to spawn dispatch worker")?;

        Ok(Self {
            handles,
            control_tx,
            intake_closed,
            stats,
            worker: Some(worker),
            report: None,
        })
    }

    /// Producer handles for every live stream, in registration order.
    pub fn handles(&self) -> &[StreamHandle] {
        &self.handles
    }

    pub fn handle(&self, tag: &str) -> Option<StreamHandle> {
        self.handles.iter().find(|h| h.tag() == tag).cloned()
    }

    /// Tears a stream down from outside the worker.
    pub fn unregister(&self, id: StreamId) -> anyhow::Result<()> {
        self.control_tx
            .send(ControlMessage::Unregister(id))
            .map_err(|e| anyhow::anyhow!("Failed to unregister stream {}: {}", id, e))
    }

    /// Returns the latest published stream snapshot.
    pub fn stats(&self) -> Vec<StreamSnapshot> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns a shared handle to the snapshot table for external polling.
    pub fn stats_handle(&self) -> Arc<Mutex<Vec<StreamSnapshot>>> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stops intake, lets the worker drain within the configured grace
    /// period, and returns its report. Idempotent.
    pub fn shutdown(&mut self) -> Option<DispatchReport> {
        if let Some(worker) = self.worker.take() {
            self.intake_closed.store(true, Ordering::Release);
            let _ = self.control_tx.send(ControlMessage::Shutdown);
            self.report = worker.join().ok();
        }
        self.report.clone()
    }
}

impl Drop for MuxRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker<S: StreamSink>(
    mut dispatcher: Dispatcher<S>,
    control_rx: Receiver<ControlMessage>,
    stats: Arc<Mutex<Vec<StreamSnapshot>>>,
    config: DispatchConfig,
) -> DispatchReport {
    let publish = |dispatcher: &Dispatcher<S>| {
        let snapshot = dispatcher.registry().snapshot();
        *stats.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    };
    let mut last_stats = Instant::now();

    loop {
        // Control path: at most one message per round.
        match control_rx.try_recv() {
            Ok(ControlMessage::Unregister(id)) => {
                if let Err(e) = dispatcher.unregister(id) {
                    debug!(stream = %id, error = %e, "unregister ignored");
                }
            }
            Ok(ControlMessage::Shutdown) => break,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        // Hot path: one message per round; park on the queues when idle.
        if let DispatchOutcome::Idle = dispatcher.step() {
            dispatcher.wait_for_work(&control_rx, config.idle_wait);
        }

        if last_stats.elapsed() >= config.stats_interval {
            publish(&dispatcher);
            last_stats = Instant::now();
        }
    }

    publish(&dispatcher);
    let report = dispatcher.shutdown(config.drain_grace);
    info!(
        streams = report.streams.len(),
        total_sent = report.total_sent(),
        forced = report.forced,
        "dispatch loop stopped"
    );
    report
}
