//! # imu-mux
//!
//! Multiplexes accelerometer and gyroscope feeds from one producer onto a
//! shared multi-stream transport, giving one feed priority over the other
//! without starving either.
//!
//! ## Crate structure
//!
//! - [`scheduler`]: per-stream bounded queues, the stream registry and the
//!   weighted-fair selector
//! - [`dispatch`]: the send loop that drains queues one message per round
//! - [`runtime`]: worker thread, control channel and stats publishing
//! - [`net`]: transport sinks (`StreamSink` trait, in-process and TCP)
//! - [`sensor`]: IMU line decoding and the producer thread
//! - [`record`]: `TAG:x,y,z` record framing and handshake tags
//! - [`receiver`]: receiving side: handshake, record decode, rate logging
//! - [`config`]: TOML configuration
//! - [`error`]: the crate error type

pub mod config;
pub mod dispatch;
pub mod error;
pub mod net;
pub mod receiver;
pub mod record;
pub mod runtime;
pub mod scheduler;
pub mod sensor;

pub use error::MuxError;
