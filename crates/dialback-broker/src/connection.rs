//! Parked tunnel connections

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Any bidirectional byte stream the broker can park
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// Type-erased stream held by a [`TunnelConnection`]
pub type BoxedStream = Box<dyn TunnelIo>;

/// A raw connection taken over from an agent registration
///
/// Owned by exactly one holder at a time: a rendezvous queue while parked,
/// then whoever dialed it. Reads and writes go straight to the underlying
/// stream.
pub struct TunnelConnection {
    stream: BoxedStream,
    remote_addr: String,
}

impl TunnelConnection {
    pub fn new<S: TunnelIo + 'static>(stream: S, remote_addr: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            remote_addr: remote_addr.into(),
        }
    }

    /// Address of the agent that opened this connection
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn into_inner(self) -> BoxedStream {
        self.stream
    }

    /// Shut down the write side and drop the connection
    pub(crate) async fn terminate(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(
                peer = %self.remote_addr,
                "Shutdown of parked connection failed: {}",
                e
            );
        }
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reads_and_writes_pass_through() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut conn = TunnelConnection::new(near, "10.0.0.7:51000");
        assert_eq!(conn.remote_addr(), "10.0.0.7:51000");

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_terminate_signals_eof() {
        let (near, mut far) = tokio::io::duplex(64);
        TunnelConnection::new(near, "peer").terminate().await;

        let mut buf = Vec::new();
        let n = far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
