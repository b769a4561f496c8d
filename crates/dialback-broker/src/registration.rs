//! Agent registration handling
//!
//! Terminates the handshake at the transport level: the request head is read
//! byte by byte so nothing beyond it is consumed, then the raw stream is
//! parked as-is.

use crate::broker::Broker;
use crate::connection::{TunnelConnection, TunnelIo};
use dialback_proto::{
    is_head_complete, parse_duration, parse_request_head, status_response, RegistrationQuery,
    TunnelError, MAX_HEAD_SIZE, REGISTER_METHOD,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Reasons a registration attempt is refused
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Bad registration request: {0}")]
    BadRequest(String),

    #[error("Broker is not active")]
    Forbidden,

    #[error("Unknown registration path: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("No free slot for {0} before the parking timeout")]
    GatewayTimeout(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl RegistrationError {
    /// Status code written back to the agent, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RegistrationError::BadRequest(_) => Some(400),
            RegistrationError::Forbidden => Some(403),
            RegistrationError::NotFound(_) => Some(404),
            RegistrationError::MethodNotAllowed(_) => Some(405),
            RegistrationError::GatewayTimeout(_) => Some(504),
            RegistrationError::Tunnel(TunnelError::Malformed(_)) => Some(400),
            RegistrationError::Tunnel(_) => None,
        }
    }
}

/// What a valid registration asked for
struct Admission {
    name: String,
    park_timeout: Duration,
}

/// Read up to and including the blank line ending the request head
async fn read_request_head<S: TunnelIo>(stream: &mut S) -> Result<Vec<u8>, TunnelError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    loop {
        if stream.read(&mut byte).await? == 0 {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during registration",
            )));
        }
        head.push(byte[0]);

        if is_head_complete(&head) {
            return Ok(head);
        }
        if head.len() >= MAX_HEAD_SIZE {
            return Err(TunnelError::Malformed("request head too large".to_string()));
        }
    }
}

async fn reject<S: TunnelIo>(stream: &mut S, code: u16) {
    if let Err(e) = stream.write_all(status_response(code).as_bytes()).await {
        debug!("Failed to send {} to agent: {}", code, e);
        return;
    }
    let _ = stream.shutdown().await;
}

impl Broker {
    /// Handle one inbound registration on a raw stream
    ///
    /// On success the stream is parked under the requested name and later
    /// handed to a dialer; nothing more is written to it here. Every refusal
    /// writes a status line and closes the stream, leaving other queues
    /// untouched.
    pub async fn serve_registration<S>(
        &self,
        mut stream: S,
        remote_addr: impl Into<String>,
    ) -> Result<(), RegistrationError>
    where
        S: TunnelIo + 'static,
    {
        let remote_addr = remote_addr.into();

        let head = tokio::time::timeout(
            self.config.handshake_timeout,
            read_request_head(&mut stream),
        )
        .await
        .unwrap_or(Err(TunnelError::Timeout));

        let admission = match head
            .map_err(RegistrationError::from)
            .and_then(|head| self.admit(&head))
        {
            Ok(admission) => admission,
            Err(e) => {
                if let Some(code) = e.status_code() {
                    reject(&mut stream, code).await;
                }
                debug!(peer = %remote_addr, "Registration refused: {}", e);
                return Err(e);
            }
        };

        let queue = match self.queue(&admission.name) {
            Ok(queue) => queue,
            Err(e) => {
                debug!(peer = %remote_addr, "Registration refused: {}", e);
                reject(&mut stream, 403).await;
                return Err(RegistrationError::Forbidden);
            }
        };
        let conn = TunnelConnection::new(stream, remote_addr.clone());

        match queue.put(conn, admission.park_timeout).await {
            Ok(()) => {
                info!(
                    name = %admission.name,
                    peer = %remote_addr,
                    parked = queue.len(),
                    "Parked agent connection"
                );
                Ok(())
            }
            Err(rejected) => {
                let (error, code) = match rejected.error {
                    TunnelError::NotActive => (RegistrationError::Forbidden, 403),
                    _ => (
                        RegistrationError::GatewayTimeout(admission.name.clone()),
                        504,
                    ),
                };
                warn!(
                    name = %admission.name,
                    peer = %remote_addr,
                    "Could not park agent connection: {}", rejected.error
                );
                let mut stream = rejected.conn.into_inner();
                reject(&mut stream, code).await;
                Err(error)
            }
        }
    }

    fn admit(&self, head: &[u8]) -> Result<Admission, RegistrationError> {
        let request = parse_request_head(head)?;

        if request.method != REGISTER_METHOD {
            return Err(RegistrationError::MethodNotAllowed(request.method));
        }
        if self.is_closed() {
            return Err(RegistrationError::Forbidden);
        }

        let query = RegistrationQuery::parse(&request.target);
        if query.path != self.config.registration_path {
            return Err(RegistrationError::NotFound(query.path));
        }

        let name = match query.name {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(RegistrationError::BadRequest(
                    "missing name parameter".to_string(),
                ))
            }
        };

        let park_timeout = match query.timeout {
            Some(raw) => parse_duration(&raw)
                .map_err(|e| RegistrationError::BadRequest(e.to_string()))?
                .min(self.config.max_registration_timeout),
            None => self.config.registration_timeout,
        };

        Ok(Admission { name, park_timeout })
    }
}
