//! # TCP Transport Sink
//!
//! Carries each logical stream on its own TCP connection to the receiver.
//! A stream's connection opens with the handshake token (`accel\n`,
//! `gyro\n` or `both\n`) and then carries newline-delimited records.
//!
//! Writes are bounded by a timeout. A receiver that stops reading costs the
//! dispatch loop at most one timeout per stream before the stream is torn
//! down as lost.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::MuxError;
use crate::net::interface::StreamSink;
use crate::record::StreamTag;
use crate::scheduler::registry::StreamId;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes and records written on one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub bytes_sent: u64,
    pub records_sent: u64,
}

struct TcpLink {
    socket: TcpStream,
    counters: LinkCounters,
}

/// A [`StreamSink`] that opens one TCP connection per logical stream.
pub struct TcpSink {
    remote: SocketAddr,
    write_timeout: Duration,
    links: HashMap<StreamId, TcpLink>,
}

impl TcpSink {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            write_timeout: WRITE_TIMEOUT,
            links: HashMap::new(),
        }
    }

    /// Overrides how long one write may wait on a peer that is not reading.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn counters(&self, id: StreamId) -> Option<LinkCounters> {
        self.links.get(&id).map(|l| l.counters)
    }
}

/// Peer-side closes end the stream; anything else, including a write that
/// timed out, is a connection failure.
fn map_io_error(id: StreamId, err: io::Error) -> MuxError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => MuxError::StreamClosed(id),
        _ => MuxError::ConnectionLost {
            id,
            reason: err.to_string(),
        },
    }
}

impl StreamSink for TcpSink {
    fn open_stream(&mut self, id: StreamId, tag: &str) -> Result<(), MuxError> {
        let handshake = StreamTag::parse(tag)?.handshake();
        let mut socket = TcpStream::connect_timeout(&self.remote, CONNECT_TIMEOUT)
            .map_err(|e| map_io_error(id, e))?;
        socket
            .set_write_timeout(Some(self.write_timeout))
            .map_err(|e| map_io_error(id, e))?;
        if let Err(e) = socket.set_nodelay(true) {
            warn!(stream = %id, error = %e, "failed to set TCP_NODELAY");
        }
        socket
            .write_all(&handshake)
            .map_err(|e| map_io_error(id, e))?;

        debug!(stream = %id, tag, remote = %self.remote, "tcp stream opened");
        self.links.insert(
            id,
            TcpLink {
                socket,
                counters: LinkCounters::default(),
            },
        );
        Ok(())
    }

    fn send(&mut self, id: StreamId, payload: &[u8]) -> Result<usize, MuxError> {
        let link = self
            .links
            .get_mut(&id)
            .ok_or(MuxError::StreamClosed(id))?;
        link.socket
            .write_all(payload)
            .map_err(|e| map_io_error(id, e))?;
        link.counters.bytes_sent += payload.len() as u64;
        link.counters.records_sent += 1;
        Ok(payload.len())
    }

    fn close_stream(&mut self, id: StreamId) {
        if let Some(link) = self.links.remove(&id) {
            let _ = link.socket.shutdown(Shutdown::Write);
            debug!(
                stream = %id,
                bytes_sent = link.counters.bytes_sent,
                records_sent = link.counters.records_sent,
                "tcp stream closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn handshake_then_records() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            BufReader::new(conn)
                .lines()
                .map(|l| l.unwrap())
                .collect::<Vec<_>>()
        });

        let mut sink = TcpSink::new(addr);
        let id = StreamId::new(0, 0);
        sink.open_stream(id, "gyro").unwrap();
        sink.send(id, b"GYRO:1.000,2.000,3.000\n").unwrap();
        sink.send(id, b"GYRO:4.000,5.000,6.000\n").unwrap();
        assert_eq!(
            sink.counters(id),
            Some(LinkCounters {
                bytes_sent: 46,
                records_sent: 2
            })
        );
        sink.close_stream(id);

        let lines = server.join().unwrap();
        assert_eq!(
            lines,
            vec!["gyro", "GYRO:1.000,2.000,3.000", "GYRO:4.000,5.000,6.000"]
        );
    }

    #[test]
    fn unknown_stream_is_closed() {
        let mut sink = TcpSink::new("127.0.0.1:9".parse().unwrap());
        let id = StreamId::new(4, 2);
        assert_eq!(sink.send(id, b"x"), Err(MuxError::StreamClosed(id)));
    }

    #[test]
    fn unknown_tag_is_refused_before_connecting() {
        let mut sink = TcpSink::new("127.0.0.1:9".parse().unwrap());
        let id = StreamId::new(0, 0);
        assert!(matches!(
            sink.open_stream(id, "mag"),
            Err(MuxError::MalformedRecord(_))
        ));
        assert_eq!(sink.counters(id), None);
    }

    #[test]
    fn stalled_peer_times_out_instead_of_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let server = thread::spawn(move || {
            // Hold the connection open without ever reading from it.
            let (_conn, _) = listener.accept().unwrap();
            let _ = release_rx.recv();
        });

        let mut sink = TcpSink::new(addr).with_write_timeout(Duration::from_millis(200));
        let id = StreamId::new(0, 0);
        sink.open_stream(id, "accel").unwrap();

        let chunk = vec![b'x'; 1 << 20];
        let started = std::time::Instant::now();
        let err = (0..256)
            .find_map(|_| sink.send(id, &chunk).err())
            .expect("peer buffers never filled");
        assert!(matches!(err, MuxError::ConnectionLost { .. }), "{err:?}");
        assert!(err.is_stream_fatal());
        assert!(started.elapsed() < Duration::from_secs(10));

        drop(release_tx);
        server.join().unwrap();
    }

    #[test]
    fn io_errors_map_to_taxonomy() {
        let id = StreamId::new(0, 0);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(map_io_error(id, reset), MuxError::StreamClosed(id));
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            map_io_error(id, refused),
            MuxError::ConnectionLost { .. }
        ));
        for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::TimedOut] {
            assert!(matches!(
                map_io_error(id, io::Error::from(kind)),
                MuxError::ConnectionLost { .. }
            ));
        }
    }
}
