//! # Dispatch Loop
//!
//! Drains the per-stream queues into the transport sink, one message per
//! round. Each round computes the ready set, asks the selector for a stream,
//! dequeues that stream's head, writes it to the sink and updates the
//! stream's bookkeeping. Sending exactly one message per round is what keeps
//! a deep queue from monopolizing the sink.
//!
//! ```text
//!          any enqueue
//!   Idle ─────────────▶ Serving ──┐ one message per round
//!    ▲                      │  ◀──┘
//!    └──────────────────────┘
//!       ready set empty after a send
//! ```
//!
//! The dispatcher is the only writer of scheduling state; it is driven from a
//! single thread (see [`crate::runtime`]).

use std::time::Duration;

use compact_str::CompactString;
use crossbeam_channel::{Receiver, Select};
use quanta::Clock;
use tracing::{trace, warn};

use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::net::interface::StreamSink;
use crate::scheduler::{StreamHandle, StreamId, StreamRegistry, StreamSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No stream has pending data.
    Idle,
    /// At least one stream has pending data.
    Serving,
}

/// What a single [`Dispatcher::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Idle,
    Sent { id: StreamId, bytes: usize },
    /// The sink failed; the stream has been torn down.
    TornDown { id: StreamId, error: MuxError },
}

/// Why [`Dispatcher::wait_for_work`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Ready,
    Control,
    Timeout,
}

/// Final accounting produced by [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Every stream torn down during the dispatcher's life, in teardown order.
    pub streams: Vec<StreamSummary>,
    /// The drain grace period expired with messages still queued.
    pub forced: bool,
}

impl DispatchReport {
    pub fn stream(&self, tag: &str) -> Option<&StreamSummary> {
        self.streams.iter().rev().find(|s| s.tag == tag)
    }

    /// Streams that ended with queued or in-flight messages never delivered.
    pub fn undelivered(&self) -> impl Iterator<Item = &StreamSummary> {
        self.streams.iter().filter(|s| s.discarded > 0)
    }

    pub fn total_sent(&self) -> u64 {
        self.streams.iter().map(|s| s.send_count).sum()
    }
}

pub struct Dispatcher<S: StreamSink> {
    registry: StreamRegistry,
    sink: S,
    state: DispatchState,
    retired: Vec<StreamSummary>,
}

impl<S: StreamSink> Dispatcher<S> {
    pub fn new(registry: StreamRegistry, sink: S) -> Self {
        Self {
            registry,
            sink,
            state: DispatchState::Idle,
            retired: Vec::new(),
        }
    }

    /// Builds an empty registry from `config`; streams are registered separately.
    pub fn from_config(config: &MuxConfig, sink: S, clock: Clock) -> Self {
        Self::new(
            StreamRegistry::new(clock, config.queue, config.duplicate_tag),
            sink,
        )
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Registers `tag` and opens its logical stream on the sink.
    ///
    /// If the sink cannot open the stream the registration is rolled back.
    pub fn register(&mut self, tag: &str, weight: u32) -> Result<StreamId, MuxError> {
        let registered = self.registry.register(tag, weight)?;
        if let Some(old) = registered.replaced {
            self.sink.close_stream(old.id);
            self.retired.push(old);
        }

        if let Err(error) = self.sink.open_stream(registered.id, tag) {
            warn!(stream = %registered.id, tag, %error, "sink refused stream");
            let _ = self.registry.unregister(registered.id);
            return Err(error);
        }
        Ok(registered.id)
    }

    /// Tears `id` down: discards its queue and closes it on the sink.
    pub fn unregister(&mut self, id: StreamId) -> Result<StreamSummary, MuxError> {
        let summary = self.registry.unregister(id)?;
        self.sink.close_stream(id);
        self.retired.push(summary.clone());
        Ok(summary)
    }

    pub fn handle(&self, id: StreamId) -> Result<StreamHandle, MuxError> {
        self.registry.handle(id)
    }

    /// Runs one scheduling round.
    pub fn step(&mut self) -> DispatchOutcome {
        let ready = self.registry.ready_set();
        if ready.is_empty() {
            self.state = DispatchState::Idle;
            return DispatchOutcome::Idle;
        }
        self.state = DispatchState::Serving;

        let now = self.registry.clock().now();
        let Ok(Some(id)) = self.registry.select(&ready, now) else {
            return DispatchOutcome::Idle;
        };
        let Ok(message) = self.registry.dequeue(id) else {
            return DispatchOutcome::Idle;
        };

        match self.sink.send(id, &message) {
            Ok(bytes) => {
                let sent_at = self.registry.clock().now();
                let _ = self.registry.record_send(id, sent_at);
                trace!(stream = %id, bytes, "dispatched");
                if !self.registry.has_pending() {
                    self.state = DispatchState::Idle;
                }
                DispatchOutcome::Sent { id, bytes }
            }
            Err(error) => {
                self.tear_down_failed(id, &error);
                if !self.registry.has_pending() {
                    self.state = DispatchState::Idle;
                }
                DispatchOutcome::TornDown { id, error }
            }
        }
    }

    fn tear_down_failed(&mut self, id: StreamId, error: &MuxError) {
        let tag = self
            .registry
            .get(id)
            .map(|d| CompactString::from(d.tag()))
            .unwrap_or_default();
        if error.is_stream_fatal() {
            warn!(stream = %id, %tag, %error, "stream lost, tearing down");
        } else {
            warn!(stream = %id, %tag, %error, "unexpected sink error, tearing down");
        }
        if let Ok(mut summary) = self.registry.unregister(id) {
            // The message that failed was already dequeued.
            summary.discarded += 1;
            self.sink.close_stream(id);
            self.retired.push(summary);
        }
    }

    /// Steps until no stream has pending data. Returns the number of sends.
    pub fn run_until_idle(&mut self) -> usize {
        let mut sent = 0;
        loop {
            match self.step() {
                DispatchOutcome::Idle => return sent,
                DispatchOutcome::Sent { .. } => sent += 1,
                DispatchOutcome::TornDown { .. } => {}
            }
        }
    }

    /// Blocks until any stream queue has data, `control` has a message, or
    /// `timeout` elapses.
    pub fn wait_for_work<T>(&self, control: &Receiver<T>, timeout: Duration) -> Wakeup {
        if self.registry.has_pending() {
            return Wakeup::Ready;
        }
        let mut sel = Select::new();
        let control_idx = sel.recv(control);
        for rx in self.registry.receivers() {
            sel.recv(rx);
        }
        match sel.ready_timeout(timeout) {
            Ok(idx) if idx == control_idx => Wakeup::Control,
            Ok(_) => Wakeup::Ready,
            Err(_) => Wakeup::Timeout,
        }
    }

    /// Stops intake, drains within `grace`, then tears every stream down.
    ///
    /// Handles reject new messages from the moment this is called. Messages
    /// already queued are delivered until the queues are empty or `grace`
    /// elapses on the registry's clock; whatever remains is discarded and
    /// reported.
    pub fn shutdown(&mut self, grace: Duration) -> DispatchReport {
        self.registry.close_intake();
        let clock = self.registry.clock().clone();
        let deadline = clock.now() + grace;

        let mut forced = false;
        while self.registry.has_pending() {
            if clock.now() >= deadline {
                forced = true;
                break;
            }
            self.step();
        }

        if forced {
            let pending: Vec<String> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|s| s.queued > 0)
                .map(|s| format!("{}={}", s.tag, s.queued))
                .collect();
            warn!(
                grace_ms = grace.as_millis() as u64,
                undelivered = ?pending,
                "drain grace period exceeded"
            );
        }

        for id in self.registry.ids() {
            let _ = self.unregister(id);
        }
        self.state = DispatchState::Idle;

        DispatchReport {
            streams: std::mem::take(&mut self.retired),
            forced,
        }
    }
}
