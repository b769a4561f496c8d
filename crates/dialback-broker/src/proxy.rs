//! Local TCP exposure of a named tunnel
//!
//! Binds a local port on the broker host; every client that connects gets a
//! freshly dialed tunnel to the named agent, with bytes copied both ways.

use crate::broker::Broker;
use crate::server::{bind, ServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Exposes one tunnel name on a local TCP listener
pub struct DialProxy {
    broker: Arc<Broker>,
    name: String,
}

impl DialProxy {
    pub fn new(broker: Arc<Broker>, name: impl Into<String>) -> Self {
        Self {
            broker,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind `addr` and proxy clients until the broker is closed
    pub async fn start(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = bind(addr).await?;
        self.run(listener).await
    }

    /// Proxy clients from an already bound listener until the broker is closed
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!(name = %self.name, "Exposing tunnel on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.broker.closed() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((client, peer_addr)) => {
                        let broker = self.broker.clone();
                        let name = self.name.clone();
                        tokio::spawn(async move {
                            Self::handle_client(broker, name, client, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }

    async fn handle_client(
        broker: Arc<Broker>,
        name: String,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let _ = client.set_nodelay(true);

        let mut tunnel = match broker.dial(&name).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(name = %name, client = %peer_addr, "Dial failed: {}", e);
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut client, &mut tunnel).await {
            Ok((to_agent, to_client)) => {
                debug!(
                    name = %name,
                    client = %peer_addr,
                    bytes_to_agent = to_agent,
                    bytes_to_client = to_client,
                    "Proxied connection finished"
                );
            }
            Err(e) => {
                debug!(name = %name, client = %peer_addr, "Proxied connection ended: {}", e);
            }
        }
    }
}
