//! Tunnel agent
//!
//! Keeps registrations parked at a broker and exposes the connections that
//! consumers dial through them as if they had arrived on a local listener.

pub mod config;
pub mod connector;
pub mod dial;
pub mod forwarder;

pub use config::{clamp_threads, AgentConfig, DEFAULT_THREADS, MAX_THREADS};
pub use connector::AgentConnector;
pub use forwarder::{ForwarderError, TcpForwarder};
