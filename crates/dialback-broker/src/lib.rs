//! Tunnel broker
//!
//! Parks raw connections that agents push out under a logical name and hands
//! them to whoever dials that name.

pub mod broker;
pub mod config;
pub mod connection;
pub mod proxy;
pub mod queue;
pub mod registration;
pub mod server;

pub use broker::{Broker, DialSignal};
pub use config::BrokerConfig;
pub use connection::{BoxedStream, TunnelConnection, TunnelIo};
pub use proxy::DialProxy;
pub use queue::{ParkRejected, RendezvousQueue};
pub use registration::RegistrationError;
pub use server::{BrokerServer, BrokerServerConfig, ServerError};
