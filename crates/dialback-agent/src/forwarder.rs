//! Forwarding of accepted tunnel connections to a local service

use crate::connector::AgentConnector;
use dialback_proto::TunnelError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Errors that can occur during TCP forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to target address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Bridges each tunnel connection to one fixed target address
pub struct TcpForwarder {
    target: String,
}

impl TcpForwarder {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Connect to the target and copy bytes both ways until either side closes
    ///
    /// Returns (bytes_to_target, bytes_to_tunnel).
    pub async fn forward(&self, mut tunnel: TcpStream) -> Result<(u64, u64), ForwarderError> {
        let mut target = TcpStream::connect(&self.target).await.map_err(|e| {
            ForwarderError::ConnectionFailed {
                address: self.target.clone(),
                source: e,
            }
        })?;
        let _ = target.set_nodelay(true);

        tracing::debug!(target_address = %self.target, "Connected to target address");

        let (to_target, to_tunnel) =
            tokio::io::copy_bidirectional(&mut tunnel, &mut target).await?;

        tracing::debug!(
            target_address = %self.target,
            bytes_to_target = to_target,
            bytes_to_tunnel = to_tunnel,
            "TCP forward completed"
        );

        Ok((to_target, to_tunnel))
    }

    /// Accept from `connector` and forward every connection until it is closed
    pub async fn serve(self: Arc<Self>, connector: &AgentConnector) -> Result<(), TunnelError> {
        loop {
            match connector.accept().await {
                Ok(tunnel) => {
                    let forwarder = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forwarder.forward(tunnel).await {
                            tracing::warn!("Forwarding failed: {}", e);
                        }
                    });
                }
                Err(TunnelError::ListenerClosed) => return Ok(()),
                Err(e) if e.is_temporary() => {
                    tracing::debug!("Temporary accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
