pub mod channel;
pub mod interface;
pub mod transport;
