//! Sensor input side: decoding raw IMU lines and feeding stream queues.

pub mod imu;
pub mod producer;

pub use imu::ImuReading;
pub use producer::{ProducerStats, SampleRoutes, SensorProducer};
