use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use compact_str::CompactString;
use crossbeam_channel::Receiver;
use quanta::{Clock, Instant};
use slab::Slab;
use tracing::info;

use crate::config::{DuplicateTagPolicy, QueueConfig};
use crate::error::MuxError;
use crate::scheduler::queue::{StreamHandle, StreamQueue};
use crate::scheduler::selector;

/// Stable handle to a registered stream.
///
/// `serial` is unique for the lifetime of the registry and orders ids by
/// registration; `slot` indexes the arena. A stale id whose slot has been
/// reused is detected by its serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    serial: u64,
    slot: usize,
}

impl StreamId {
    pub(crate) fn new(serial: u64, slot: usize) -> Self {
        Self { serial, slot }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.serial)
    }
}

/// Scheduling state of one stream. Only the dispatch loop mutates it.
///
/// `virtual_service` is the stream's service in sends per unit of weight. It
/// only counts the current busy period: when a stream goes from empty to
/// ready it is lifted to the registry's virtual time, so service received
/// while nothing competed with it is not held against it later.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    id: StreamId,
    tag: CompactString,
    weight: u32,
    last_sent_at: Instant,
    send_count: u64,
    virtual_service: f64,
    waiting_since: Instant,
    backlogged: bool,
}

impl StreamDescriptor {
    pub(crate) fn new(id: StreamId, tag: &str, weight: u32, registered_at: Instant) -> Self {
        Self {
            id,
            tag: CompactString::from(tag),
            weight,
            last_sent_at: registered_at,
            send_count: 0,
            virtual_service: 0.0,
            waiting_since: registered_at,
            backlogged: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Time of the last successful send, or registration time.
    pub fn last_sent_at(&self) -> Instant {
        self.last_sent_at
    }

    pub fn send_count(&self) -> u64 {
        self.send_count
    }

    pub fn virtual_service(&self) -> f64 {
        self.virtual_service
    }

    /// Start of the current wait: the last send, or the moment the stream
    /// last became ready after running empty.
    pub fn waiting_since(&self) -> Instant {
        self.waiting_since
    }

    pub(crate) fn record_send(&mut self, at: Instant) {
        self.last_sent_at = at;
        self.waiting_since = at;
        self.send_count += 1;
        self.virtual_service += 1.0 / f64::from(self.weight);
    }

    /// Starts a busy period: no credit for idle time, no debt from earlier
    /// uncontended service.
    fn activate(&mut self, virtual_time: f64, now: Instant) {
        self.virtual_service = self.virtual_service.max(virtual_time);
        self.waiting_since = now;
        self.backlogged = true;
    }
}

/// Final accounting for a stream that has been torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub id: StreamId,
    pub tag: CompactString,
    pub weight: u32,
    pub send_count: u64,
    /// Messages still queued (or in flight) when the stream was torn down.
    pub discarded: usize,
    /// Messages rejected with `QueueFull` over the stream's lifetime.
    pub dropped: u64,
}

/// Point-in-time view of a live stream, for stats publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub id: StreamId,
    pub tag: CompactString,
    pub weight: u32,
    pub send_count: u64,
    pub queued: usize,
    pub enqueued: u64,
    pub dropped: u64,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub id: StreamId,
    /// The stream this registration displaced under `DuplicateTagPolicy::Replace`.
    pub replaced: Option<StreamSummary>,
}

struct StreamEntry {
    descriptor: StreamDescriptor,
    queue: StreamQueue,
}

/// Owned table of stream descriptors and their paired queues.
///
/// A descriptor and its queue are created and destroyed together. Ids are
/// never reused, so a handle to a torn-down stream fails with
/// `UnknownStream` instead of reaching a newer stream in the same slot.
pub struct StreamRegistry {
    entries: Slab<StreamEntry>,
    by_tag: HashMap<CompactString, StreamId>,
    next_serial: u64,
    clock: Clock,
    queue: QueueConfig,
    duplicate_tag: DuplicateTagPolicy,
    closed: Arc<AtomicBool>,
    /// Highest `virtual_service` any stream has started a send from.
    virtual_time: f64,
}

impl StreamRegistry {
    pub fn new(clock: Clock, queue: QueueConfig, duplicate_tag: DuplicateTagPolicy) -> Self {
        Self {
            entries: Slab::new(),
            by_tag: HashMap::new(),
            next_serial: 0,
            clock,
            queue,
            duplicate_tag,
            closed: Arc::new(AtomicBool::new(false)),
            virtual_time: 0.0,
        }
    }

    /// Registry with default queue capacity and `Reject` duplicate policy.
    pub fn with_clock(clock: Clock) -> Self {
        Self::new(clock, QueueConfig::default(), DuplicateTagPolicy::default())
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Allocates a fresh id, a descriptor stamped with the current time and a
    /// bounded queue for `tag`.
    pub fn register(&mut self, tag: &str, weight: u32) -> Result<Registered, MuxError> {
        if weight == 0 {
            return Err(MuxError::InvalidWeight {
                tag: tag.to_string(),
                weight: 0,
            });
        }

        let replaced = match self.by_tag.get(tag).copied() {
            Some(existing) => match self.duplicate_tag {
                DuplicateTagPolicy::Reject => {
                    return Err(MuxError::DuplicateTag(tag.to_string()));
                }
                DuplicateTagPolicy::Replace => Some(self.unregister(existing)?),
            },
            None => None,
        };

        let serial = self.next_serial;
        self.next_serial += 1;

        let vacant = self.entries.vacant_entry();
        let id = StreamId::new(serial, vacant.key());
        vacant.insert(StreamEntry {
            descriptor: StreamDescriptor::new(id, tag, weight, self.clock.now()),
            queue: StreamQueue::new(self.queue.capacity),
        });
        self.by_tag.insert(CompactString::from(tag), id);

        info!(
            stream = %id,
            tag,
            weight,
            capacity = self.queue.capacity,
            replaced = replaced.is_some(),
            "stream registered"
        );
        Ok(Registered { id, replaced })
    }

    fn entry(&self, id: StreamId) -> Result<&StreamEntry, MuxError> {
        self.entries
            .get(id.slot)
            .filter(|e| e.descriptor.id == id)
            .ok_or(MuxError::UnknownStream(id))
    }

    fn entry_mut(&mut self, id: StreamId) -> Result<&mut StreamEntry, MuxError> {
        self.entries
            .get_mut(id.slot)
            .filter(|e| e.descriptor.id == id)
            .ok_or(MuxError::UnknownStream(id))
    }

    pub fn get(&self, id: StreamId) -> Result<&StreamDescriptor, MuxError> {
        self.entry(id).map(|e| &e.descriptor)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.entry(id).is_ok()
    }

    pub fn id_for_tag(&self, tag: &str) -> Option<StreamId> {
        self.by_tag.get(tag).copied()
    }

    pub fn stream_count(&self) -> usize {
        self.entries.len()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.entries.iter().map(|(_, e)| e.descriptor.id).collect();
        ids.sort();
        ids
    }

    /// Removes the descriptor and discards whatever is left in its queue.
    ///
    /// A second call for the same id fails with `UnknownStream`.
    pub fn unregister(&mut self, id: StreamId) -> Result<StreamSummary, MuxError> {
        self.entry(id)?;
        let entry = self.entries.remove(id.slot);
        let descriptor = entry.descriptor;
        if self.by_tag.get(&descriptor.tag) == Some(&id) {
            self.by_tag.remove(&descriptor.tag);
        }

        let dropped = entry.queue.counters().dropped();
        let discarded = entry.queue.discard();
        info!(
            stream = %id,
            tag = %descriptor.tag,
            send_count = descriptor.send_count,
            discarded,
            dropped,
            "stream torn down"
        );

        Ok(StreamSummary {
            id,
            tag: descriptor.tag,
            weight: descriptor.weight,
            send_count: descriptor.send_count,
            discarded,
            dropped,
        })
    }

    /// Producer-side handle for `id`, honoring the configured backpressure policy.
    pub fn handle(&self, id: StreamId) -> Result<StreamHandle, MuxError> {
        let entry = self.entry(id)?;
        Ok(entry.queue.handle(
            id,
            entry.descriptor.tag(),
            self.queue.backpressure,
            self.closed.clone(),
        ))
    }

    /// Appends `message` to the stream's queue.
    ///
    /// Under the blocking policy this waits for space, so it must not be called
    /// on a full queue from the thread that drains it.
    pub fn enqueue(&self, id: StreamId, message: Bytes) -> Result<(), MuxError> {
        self.handle(id)?.enqueue(message)
    }

    /// Removes and returns the head of the stream's queue without blocking.
    pub fn dequeue(&self, id: StreamId) -> Result<Bytes, MuxError> {
        self.entry(id)?
            .queue
            .try_dequeue()
            .ok_or(MuxError::QueueEmpty(id))
    }

    /// True when nothing is queued for `id`. Unknown ids have nothing queued.
    pub fn is_empty(&self, id: StreamId) -> bool {
        self.entry(id).map(|e| e.queue.is_empty()).unwrap_or(true)
    }

    pub fn queued(&self, id: StreamId) -> usize {
        self.entry(id).map(|e| e.queue.len()).unwrap_or(0)
    }

    /// Post-send bookkeeping: `last_sent_at = at`, `send_count += 1`.
    ///
    /// A stream whose queue is now empty ends its busy period.
    pub fn record_send(&mut self, id: StreamId, at: Instant) -> Result<(), MuxError> {
        let virtual_time = self.virtual_time;
        let entry = self.entry_mut(id)?;
        let started_at = entry.descriptor.virtual_service;
        entry.descriptor.record_send(at);
        if entry.queue.is_empty() {
            entry.descriptor.backlogged = false;
        }
        self.virtual_time = virtual_time.max(started_at);
        Ok(())
    }

    /// Ids with at least one pending message, ascending.
    pub fn ready_set(&self) -> Vec<StreamId> {
        let mut ready: Vec<StreamId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.queue.is_empty())
            .map(|(_, e)| e.descriptor.id)
            .collect();
        ready.sort();
        ready
    }

    /// True when any stream has a pending message.
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|(_, e)| !e.queue.is_empty())
    }

    /// Runs the weighted-fair selector over `ready`.
    ///
    /// Streams in `ready` that were empty at their last send start a new busy
    /// period here.
    pub fn select(
        &mut self,
        ready: &[StreamId],
        now: Instant,
    ) -> Result<Option<StreamId>, MuxError> {
        let virtual_time = self.virtual_time;
        for &id in ready {
            let descriptor = &mut self.entry_mut(id)?.descriptor;
            if !descriptor.backlogged {
                descriptor.activate(virtual_time, now);
            }
        }
        let candidates = ready
            .iter()
            .map(|&id| self.get(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(selector::select_next(&candidates, now))
    }

    /// Makes every handle reject further messages with `StreamClosed`.
    pub fn close_intake(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn intake_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    pub fn snapshot(&self) -> Vec<StreamSnapshot> {
        let mut out: Vec<StreamSnapshot> = self
            .entries
            .iter()
            .map(|(_, e)| StreamSnapshot {
                id: e.descriptor.id,
                tag: e.descriptor.tag.clone(),
                weight: e.descriptor.weight,
                send_count: e.descriptor.send_count,
                queued: e.queue.len(),
                enqueued: e.queue.counters().enqueued(),
                dropped: e.queue.counters().dropped(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub(crate) fn receivers(&self) -> impl Iterator<Item = &Receiver<Bytes>> {
        self.entries.iter().map(|(_, e)| e.queue.receiver())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;
    use std::time::Duration;

    fn registry() -> (StreamRegistry, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (StreamRegistry::with_clock(clock), mock)
    }

    #[test]
    fn register_initializes_descriptor() {
        let (mut reg, mock) = registry();
        mock.increment(Duration::from_secs(3));
        let id = reg.register("accel", 256).unwrap().id;

        let desc = reg.get(id).unwrap();
        assert_eq!(desc.tag(), "accel");
        assert_eq!(desc.weight(), 256);
        assert_eq!(desc.send_count(), 0);
        assert_eq!(desc.last_sent_at(), reg.clock().now());
        assert!(reg.is_empty(id));
        assert_eq!(reg.id_for_tag("accel"), Some(id));
    }

    #[test]
    fn zero_weight_is_rejected() {
        let (mut reg, _) = registry();
        let err = reg.register("gyro", 0).unwrap_err();
        assert!(matches!(err, MuxError::InvalidWeight { weight: 0, .. }));
        assert_eq!(reg.stream_count(), 0);
    }

    #[test]
    fn ids_are_ordered_by_registration() {
        let (mut reg, _) = registry();
        let a = reg.register("accel", 1).unwrap().id;
        let b = reg.register("gyro", 1).unwrap().id;
        assert!(a < b);
        assert_eq!(reg.ids(), vec![a, b]);
    }

    #[test]
    fn duplicate_tag_rejected_by_default() {
        let (mut reg, _) = registry();
        let first = reg.register("accel", 10).unwrap().id;
        assert_eq!(
            reg.register("accel", 20),
            Err(MuxError::DuplicateTag("accel".into()))
        );
        assert_eq!(reg.get(first).unwrap().weight(), 10);
    }

    #[test]
    fn duplicate_tag_replace_tears_down_old_stream() {
        let (clock, _) = Clock::mock();
        let mut reg = StreamRegistry::new(
            clock,
            QueueConfig::default(),
            DuplicateTagPolicy::Replace,
        );
        let old = reg.register("accel", 10).unwrap().id;
        reg.enqueue(old, Bytes::from_static(b"stale")).unwrap();

        let registered = reg.register("accel", 20).unwrap();
        let summary = registered.replaced.unwrap();
        assert_eq!(summary.id, old);
        assert_eq!(summary.discarded, 1);
        assert_ne!(registered.id, old);
        assert!(matches!(reg.get(old), Err(MuxError::UnknownStream(_))));
        assert_eq!(reg.id_for_tag("accel"), Some(registered.id));
    }

    #[test]
    fn unregister_discards_queue_and_invalidates_id() {
        let (mut reg, _) = registry();
        let id = reg.register("gyro", 30).unwrap().id;
        let handle = reg.handle(id).unwrap();
        handle.enqueue(Bytes::from_static(b"a")).unwrap();
        handle.enqueue(Bytes::from_static(b"b")).unwrap();
        reg.dequeue(id).unwrap();
        reg.record_send(id, reg.clock().now()).unwrap();

        let summary = reg.unregister(id).unwrap();
        assert_eq!(summary.tag, "gyro");
        assert_eq!(summary.send_count, 1);
        assert_eq!(summary.discarded, 1);

        assert!(matches!(reg.get(id), Err(MuxError::UnknownStream(_))));
        assert_eq!(
            reg.enqueue(id, Bytes::from_static(b"c")),
            Err(MuxError::UnknownStream(id))
        );
        assert_eq!(
            handle.enqueue(Bytes::from_static(b"c")),
            Err(MuxError::UnknownStream(id))
        );
        assert_eq!(reg.unregister(id), Err(MuxError::UnknownStream(id)));
        assert!(reg.id_for_tag("gyro").is_none());
    }

    #[test]
    fn stale_id_does_not_alias_reused_slot() {
        let (mut reg, _) = registry();
        let old = reg.register("accel", 1).unwrap().id;
        reg.unregister(old).unwrap();
        let new = reg.register("accel", 1).unwrap().id;

        assert_eq!(old.slot, new.slot);
        assert!(!reg.contains(old));
        assert!(reg.contains(new));
        assert_eq!(reg.dequeue(old), Err(MuxError::UnknownStream(old)));
    }

    #[test]
    fn dequeue_on_empty_queue_fails() {
        let (mut reg, _) = registry();
        let id = reg.register("accel", 1).unwrap().id;
        assert_eq!(reg.dequeue(id), Err(MuxError::QueueEmpty(id)));
    }

    #[test]
    fn ready_set_tracks_non_empty_queues() {
        let (mut reg, _) = registry();
        let a = reg.register("accel", 1).unwrap().id;
        let b = reg.register("gyro", 1).unwrap().id;
        assert!(reg.ready_set().is_empty());

        reg.enqueue(b, Bytes::from_static(b"g")).unwrap();
        assert_eq!(reg.ready_set(), vec![b]);
        reg.enqueue(a, Bytes::from_static(b"a")).unwrap();
        assert_eq!(reg.ready_set(), vec![a, b]);

        reg.dequeue(b).unwrap();
        assert_eq!(reg.ready_set(), vec![a]);
    }

    #[test]
    fn record_send_updates_bookkeeping() {
        let (mut reg, mock) = registry();
        let id = reg.register("accel", 5).unwrap().id;
        mock.increment(Duration::from_millis(40));
        let at = reg.clock().now();
        reg.record_send(id, at).unwrap();
        reg.record_send(id, at).unwrap();

        let desc = reg.get(id).unwrap();
        assert_eq!(desc.send_count(), 2);
        assert_eq!(desc.last_sent_at(), at);
    }

    #[test]
    fn uncontended_sends_are_not_held_against_a_stream() {
        let (mut reg, _) = registry();
        let accel = reg.register("accel", 256).unwrap().id;
        let gyro = reg.register("gyro", 30).unwrap().id;
        let now = reg.clock().now();

        for _ in 0..100 {
            reg.enqueue(gyro, Bytes::from_static(b"g")).unwrap();
            let ready = reg.ready_set();
            assert_eq!(reg.select(&ready, now), Ok(Some(gyro)));
            reg.dequeue(gyro).unwrap();
            reg.record_send(gyro, now).unwrap();
        }
        assert!((reg.get(gyro).unwrap().virtual_service() - 100.0 / 30.0).abs() < 1e-9);

        // Accel joins at the current virtual time, just behind gyro's last send.
        reg.enqueue(accel, Bytes::from_static(b"a")).unwrap();
        reg.enqueue(gyro, Bytes::from_static(b"g")).unwrap();
        let ready = reg.ready_set();
        assert_eq!(reg.select(&ready, now), Ok(Some(accel)));
        assert!((reg.get(accel).unwrap().virtual_service() - 99.0 / 30.0).abs() < 1e-9);
        assert_eq!(reg.get(gyro).unwrap().send_count(), 100);
    }

    #[test]
    fn drop_policy_is_visible_in_snapshot() {
        let (clock, _) = Clock::mock();
        let queue = QueueConfig {
            capacity: 1,
            backpressure: BackpressurePolicy::Drop,
        };
        let mut reg = StreamRegistry::new(clock, queue, DuplicateTagPolicy::Reject);
        let id = reg.register("gyro", 1).unwrap().id;
        reg.enqueue(id, Bytes::from_static(b"1")).unwrap();
        assert_eq!(
            reg.enqueue(id, Bytes::from_static(b"2")),
            Err(MuxError::QueueFull(id))
        );

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].queued, 1);
        assert_eq!(snap[0].enqueued, 1);
        assert_eq!(snap[0].dropped, 1);
    }

    #[test]
    fn close_intake_rejects_new_messages() {
        let (mut reg, _) = registry();
        let id = reg.register("accel", 1).unwrap().id;
        reg.close_intake();
        assert_eq!(
            reg.enqueue(id, Bytes::from_static(b"x")),
            Err(MuxError::StreamClosed(id))
        );
    }
}
