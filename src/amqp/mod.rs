//! AMQP backend: reconnecting connection manager, dead-letter delay
//! topology, and the adapter tying them together.

mod adapter;
mod connection;
mod topology;

pub use adapter::AmqpAdapter;
pub use connection::ConnectionManager;
pub use topology::Topology;
