//! Stream scheduling core.
//!
//! Decides which logical stream sends next when several have data pending:
//! - [`queue`]: one bounded FIFO per stream, shared with the producer
//! - [`registry`]: stream descriptors (tag, weight, send bookkeeping) paired
//!   with their queues in an owned arena
//! - [`selector`]: weighted-fair choice among the ready streams
//!
//! Within a stream, delivery order is enqueue order. Across streams there is
//! no global order: interleaving is decided by the selector alone and does
//! not follow wall-clock arrival.

pub mod queue;
pub mod registry;
pub mod selector;

pub use queue::{QueueCounters, StreamHandle};
pub use registry::{
    Registered, StreamDescriptor, StreamId, StreamRegistry, StreamSnapshot, StreamSummary,
};
