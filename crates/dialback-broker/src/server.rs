//! TCP accept loop feeding agent registrations into the broker

use crate::broker::Broker;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Broker server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Bind `addr`, mapping failures to a [`ServerError::BindError`]
pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })
}

/// Broker server configuration
#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
        }
    }
}

/// Accepts agent connections and hands each to [`Broker::serve_registration`]
pub struct BrokerServer {
    config: BrokerServerConfig,
    broker: Arc<Broker>,
}

impl BrokerServer {
    pub fn new(config: BrokerServerConfig, broker: Arc<Broker>) -> Self {
        Self { config, broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Bind the configured address and serve until the broker is closed
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = bind(self.config.bind_addr).await?;
        self.run(listener).await
    }

    /// Serve registrations from an already bound listener until the broker is closed
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!(
            "Tunnel broker listening on {} (path {})",
            local_addr,
            self.broker.config().registration_path
        );

        loop {
            tokio::select! {
                _ = self.broker.closed() => {
                    info!("Tunnel broker on {} stopped", local_addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted agent connection from {}", peer_addr);
                        let _ = socket.set_nodelay(true);
                        let broker = self.broker.clone();
                        tokio::spawn(async move {
                            let result = broker
                                .serve_registration(socket, peer_addr.to_string())
                                .await;
                            if let Err(e) = result {
                                debug!("Registration from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialback_proto::{registration_request, success_response};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_error_mentions_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert!(matches!(err, ServerError::BindError { port, .. } if port == addr.port()));
        assert!(err.to_string().contains("lsof"));
    }

    #[tokio::test]
    async fn test_server_parks_tcp_registration_and_stops_on_close() {
        let broker = Arc::new(Broker::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = BrokerServer::new(BrokerServerConfig { bind_addr: addr }, broker.clone());
        let running = tokio::spawn(async move { server.run(listener).await });

        let mut agent = TcpStream::connect(addr).await.unwrap();
        agent
            .write_all(registration_request("/tunnel?name=svc").as_bytes())
            .await
            .unwrap();

        let mut conn = broker
            .dial_timeout("svc", Duration::from_secs(5))
            .await
            .unwrap();

        let expected = success_response();
        let mut head = vec![0u8; expected.len()];
        agent.read_exact(&mut head).await.unwrap();
        assert_eq!(head, expected);

        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        broker.close().await;
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
