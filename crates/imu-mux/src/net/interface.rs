use crate::error::MuxError;
use crate::scheduler::registry::StreamId;

/// Transport abstraction the dispatcher writes to.
///
/// The dispatcher only needs two capabilities from the transport: announce
/// that logical stream `id` exists (carrying its tag as the handshake), and
/// push one complete record on it. Implemented by
/// [`crate::net::transport::TcpSink`], [`crate::net::channel::ChannelSink`]
/// and by mock sinks in tests.
pub trait StreamSink: Send {
    /// Opens logical stream `id` and sends its handshake tag.
    fn open_stream(&mut self, id: StreamId, tag: &str) -> Result<(), MuxError>;

    /// Writes one already-framed record on stream `id`. Returns bytes written.
    ///
    /// `StreamClosed` and `ConnectionLost` mean the stream is gone; the
    /// dispatcher tears it down and keeps serving the others.
    fn send(&mut self, id: StreamId, payload: &[u8]) -> Result<usize, MuxError>;

    /// Releases transport resources for `id`. Unknown ids are ignored.
    fn close_stream(&mut self, _id: StreamId) {}
}

impl<S: StreamSink + ?Sized> StreamSink for Box<S> {
    fn open_stream(&mut self, id: StreamId, tag: &str) -> Result<(), MuxError> {
        (**self).open_stream(id, tag)
    }

    fn send(&mut self, id: StreamId, payload: &[u8]) -> Result<usize, MuxError> {
        (**self).send(id, payload)
    }

    fn close_stream(&mut self, id: StreamId) {
        (**self).close_stream(id)
    }
}
