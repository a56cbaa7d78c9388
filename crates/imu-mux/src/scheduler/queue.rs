//! # Per-Stream Message Queues
//!
//! Each registered stream owns one bounded FIFO built on a crossbeam channel.
//! The queue is the only structure shared between the producer thread and the
//! dispatch loop. Producers hold cloneable [`StreamHandle`]s; the dispatcher
//! polls the receiving half and never blocks on a single stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use compact_str::CompactString;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use quanta::Instant;
use tracing::warn;

use crate::config::BackpressurePolicy;
use crate::error::MuxError;
use crate::scheduler::registry::StreamId;

/// Minimum spacing between two `QueueFull` warnings for the same stream.
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Enqueue and drop counters for one stream, readable from any thread.
#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    drop_log: Mutex<DropLog>,
}

#[derive(Debug, Default)]
struct DropLog {
    last_report: Option<Instant>,
    suppressed: u64,
}

impl QueueCounters {
    /// Messages accepted into the queue.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Messages rejected with `QueueFull`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self, id: StreamId, tag: &str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let mut log = self.drop_log.lock().unwrap_or_else(|e| e.into_inner());
        let due = log
            .last_report
            .is_none_or(|last| now.saturating_duration_since(last) >= DROP_REPORT_INTERVAL);
        if due {
            warn!(
                stream = %id,
                tag,
                dropped_total = total,
                suppressed = log.suppressed,
                "queue full, dropping message"
            );
            log.last_report = Some(now);
            log.suppressed = 0;
        } else {
            log.suppressed += 1;
        }
    }
}

/// Receiving half of a stream queue, owned by the registry.
pub(crate) struct StreamQueue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    counters: Arc<QueueCounters>,
}

impl StreamQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            counters: Arc::new(QueueCounters::default()),
        }
    }

    pub(crate) fn handle(
        &self,
        id: StreamId,
        tag: &str,
        policy: BackpressurePolicy,
        closed: Arc<AtomicBool>,
    ) -> StreamHandle {
        StreamHandle {
            id,
            tag: CompactString::from(tag),
            tx: self.tx.clone(),
            policy,
            counters: self.counters.clone(),
            closed,
        }
    }

    pub(crate) fn try_dequeue(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Bytes> {
        &self.rx
    }

    pub(crate) fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    /// Empties the queue, returning how many messages were thrown away.
    ///
    /// Handles still alive after this see `UnknownStream` on their next
    /// enqueue, because the receiving half is dropped with `self`.
    pub(crate) fn discard(self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Producer-side handle to one stream's queue.
///
/// Cloneable and `Send`; the producer thread keeps one per tag it feeds.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: StreamId,
    tag: CompactString,
    tx: Sender<Bytes>,
    policy: BackpressurePolicy,
    counters: Arc<QueueCounters>,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Appends a message to the tail of the stream's queue.
    ///
    /// Under [`BackpressurePolicy::Drop`] a full queue rejects the message with
    /// `QueueFull` and counts the drop. Under [`BackpressurePolicy::Block`] the
    /// call waits for space. Either way a torn-down stream yields
    /// `UnknownStream` and a mux that is shutting down yields `StreamClosed`.
    pub fn enqueue(&self, message: Bytes) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::StreamClosed(self.id));
        }
        match self.policy {
            BackpressurePolicy::Drop => match self.tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.counters.record_drop(self.id, &self.tag);
                    return Err(MuxError::QueueFull(self.id));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(MuxError::UnknownStream(self.id));
                }
            },
            BackpressurePolicy::Block => {
                self.tx
                    .send(message)
                    .map_err(|_| MuxError::UnknownStream(self.id))?;
            }
        }
        self.counters.record_enqueue();
        Ok(())
    }

    pub fn enqueued(&self) -> u64 {
        self.counters.enqueued()
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped()
    }

    /// Messages currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// True once the mux has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
