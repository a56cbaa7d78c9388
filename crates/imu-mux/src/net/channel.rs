//! In-process sink that forwards every transport action as a [`SinkEvent`].

use bytes::Bytes;
use compact_str::CompactString;
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::MuxError;
use crate::net::interface::StreamSink;
use crate::scheduler::registry::StreamId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Opened { id: StreamId, tag: CompactString },
    Data { id: StreamId, payload: Bytes },
    Closed { id: StreamId },
}

/// Sink backed by an unbounded crossbeam channel.
///
/// Dropping the receiving end makes every later `send` fail with
/// `ConnectionLost`.
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn emit(&self, id: StreamId, event: SinkEvent) -> Result<(), MuxError> {
        self.tx.send(event).map_err(|_| MuxError::ConnectionLost {
            id,
            reason: "channel receiver dropped".into(),
        })
    }
}

impl StreamSink for ChannelSink {
    fn open_stream(&mut self, id: StreamId, tag: &str) -> Result<(), MuxError> {
        self.emit(
            id,
            SinkEvent::Opened {
                id,
                tag: CompactString::from(tag),
            },
        )
    }

    fn send(&mut self, id: StreamId, payload: &[u8]) -> Result<usize, MuxError> {
        self.emit(
            id,
            SinkEvent::Data {
                id,
                payload: Bytes::copy_from_slice(payload),
            },
        )?;
        Ok(payload.len())
    }

    fn close_stream(&mut self, id: StreamId) {
        let _ = self.tx.send(SinkEvent::Closed { id });
    }
}
