pub mod bridge;
pub mod connection;
pub mod connector;
pub mod context;
pub mod forwarder;
pub mod latch;
pub mod listener;
pub mod target;

#[cfg(test)]
pub mod testing;
