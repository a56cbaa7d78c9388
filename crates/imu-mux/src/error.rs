use thiserror::Error;

use crate::scheduler::registry::StreamId;

/// Errors raised by the scheduling core and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// Weights must be strictly positive.
    #[error("invalid weight {weight} for stream '{tag}': weight must be positive")]
    InvalidWeight { tag: String, weight: i64 },
    /// The tag is already registered and the registry rejects duplicates.
    #[error("stream tag '{0}' is already registered")]
    DuplicateTag(String),
    /// The id was never registered or has been torn down.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    /// The stream's queue is at capacity (drop policy only).
    #[error("queue for stream {0} is full")]
    QueueFull(StreamId),
    /// Nothing to dequeue.
    #[error("queue for stream {0} is empty")]
    QueueEmpty(StreamId),
    /// The logical stream is gone on the transport, or the mux is shutting down.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),
    /// The transport connection carrying the stream failed.
    #[error("connection lost on stream {id}: {reason}")]
    ConnectionLost { id: StreamId, reason: String },
    /// An input line or wire record did not have the expected shape.
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MuxError {
    /// True for sink failures that end a single logical stream.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            MuxError::StreamClosed(_) | MuxError::ConnectionLost { .. }
        )
    }
}
