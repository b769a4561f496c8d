//! Dialback Library - Public API for Rust applications using dialback tunnels
//!
//! A service behind NAT (the agent) keeps outbound connections parked at a
//! publicly reachable broker under a logical name. Anyone who can reach the
//! broker dials that name and gets one of those connections back, already
//! wired to the agent, with no inbound port opened on the agent's side.
//!
//! # Quick Start - Broker
//!
//! ```ignore
//! use dialback_lib::{Broker, BrokerConfig, BrokerServer, BrokerServerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(Broker::new(BrokerConfig::default()));
//! let server = BrokerServer::new(
//!     BrokerServerConfig { bind_addr: "0.0.0.0:7000".parse()? },
//!     broker.clone(),
//! );
//! tokio::spawn(async move { server.start().await });
//!
//! // Somewhere else: reach the agent registered as "db"
//! let conn = broker.dial("db").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Quick Start - Agent
//!
//! ```ignore
//! use dialback_lib::AgentConnector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = AgentConnector::listen(10, "tcp", "relay.example.com:7000", "/tunnel?name=db")?;
//! loop {
//!     let stream = connector.accept().await?;
//!     tokio::spawn(async move { /* serve `stream` like any accepted socket */ });
//! }
//! # }
//! ```
//!
//! ## Key Components
//!
//! - **Broker**: name registry of rendezvous queues, plus `dial`
//! - **BrokerServer**: TCP accept loop feeding registrations into a broker
//! - **DialProxy**: exposes a tunnel name on a local TCP port of the broker host
//! - **RendezvousQueue**: bounded FIFO of parked connections for one name
//! - **AgentConnector**: listener-shaped pool of registration workers
//! - **TcpForwarder**: bridges accepted tunnel connections to a local service
//!
//! # Architecture
//!
//! - **`dialback-proto`**: addressing, registration handshake, error taxonomy
//! - **`dialback-broker`**: broker side (queues, registration handler, dial)
//! - **`dialback-agent`**: agent side (connector, workers, forwarding)
//!
//! All types from these crates are re-exported here for convenience.

// Re-export protocol types
pub use dialback_proto::{
    parse_duration, Address, DurationError, TunnelError, CANNED_BODY, DEFAULT_REGISTRATION_PATH,
    HANDSHAKE_LOOKAHEAD, TRANSPORT_TCP,
};

// Re-export broker types
pub use dialback_broker::{
    BoxedStream, Broker, BrokerConfig, BrokerServer, BrokerServerConfig, DialProxy, DialSignal,
    ParkRejected, RegistrationError, RendezvousQueue, ServerError, TunnelConnection, TunnelIo,
};

// Re-export agent types
pub use dialback_agent::{
    clamp_threads, AgentConfig, AgentConnector, ForwarderError, TcpForwarder, DEFAULT_THREADS,
    MAX_THREADS,
};
