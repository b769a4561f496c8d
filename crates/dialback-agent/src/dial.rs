//! Outbound registration against the broker
//!
//! A registration only completes once some consumer dials our name, so
//! waiting for the response is unbounded on purpose.

use crate::config::AgentConfig;
use dialback_proto::{
    is_head_complete, parse_status_head, registration_request, TunnelError, CANNED_BODY,
    HANDSHAKE_LOOKAHEAD, MAX_HEAD_SIZE,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

/// Open a connection to the broker and park it until a consumer claims it
pub async fn connect(config: &AgentConfig) -> Result<TcpStream, TunnelError> {
    let stream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect(config.address.hostport()),
    )
    .await
    .map_err(|_| TunnelError::Timeout)??;
    let _ = stream.set_nodelay(true);

    trace!(address = %config.address, "Connected to broker, registering");
    handshake(stream, config.address.path()).await
}

/// Register on `path` and wait for the broker's answer
///
/// Returns the raw stream positioned exactly at the first tunnel byte. The
/// stream is dropped (closed) on any failure.
pub async fn handshake<S>(mut stream: S, path: &str) -> Result<S, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(registration_request(path).as_bytes())
        .await?;
    stream.flush().await?;

    let mut reader = BufReader::with_capacity(HANDSHAKE_LOOKAHEAD, stream);
    let mut head = Vec::with_capacity(64);
    loop {
        // One byte past the limit is enough to tell an oversized head apart
        let limit = (MAX_HEAD_SIZE + 1).saturating_sub(head.len()) as u64;
        if (&mut reader).take(limit).read_until(b'\n', &mut head).await? == 0 {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed the connection during registration",
            )));
        }
        if is_head_complete(&head) {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(TunnelError::Malformed("response head too large".to_string()));
        }
    }

    let status = parse_status_head(&head)?;
    if !status.is_success() {
        return Err(TunnelError::UnexpectedResponse(status.to_string()));
    }

    // The reader never holds more than HANDSHAKE_LOOKAHEAD bytes and the body
    // is at least that long, so everything buffered is body.
    let buffered = reader.buffer().len();
    let mut stream = reader.into_inner();
    let mut rest = vec![0u8; CANNED_BODY.len() - buffered];
    stream.read_exact(&mut rest).await?;

    Ok(stream)
}
