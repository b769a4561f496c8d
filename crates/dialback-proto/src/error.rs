//! Error taxonomy shared by the broker and the agent

use thiserror::Error;

/// Tunnel errors
///
/// `DuplicateName` and `NameNotFound` are reserved for stricter name
/// management; registration currently accepts any name and a dial for an
/// unknown name simply times out.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Timed out waiting for a tunnel connection")]
    Timeout,

    #[error("Tunnel is not active")]
    NotActive,

    #[error("Rendezvous queue is full")]
    Overflow,

    #[error("Tunnel name already registered: {0}")]
    DuplicateName(String),

    #[error("Tunnel name is empty")]
    EmptyName,

    #[error("Tunnel name not found: {0}")]
    NameNotFound(String),

    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Unexpected response from broker: {0}")]
    UnexpectedResponse(String),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::Timeout)
            || matches!(self, TunnelError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }

    /// True once the owning broker, queue or listener has been shut down
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelError::NotActive | TunnelError::ListenerClosed)
    }

    /// Whether retrying the same operation later may succeed
    ///
    /// Accept loops use this to tell a closed listener apart from a
    /// transient failure.
    pub fn is_temporary(&self) -> bool {
        match self {
            TunnelError::Timeout | TunnelError::Overflow => true,
            TunnelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_closed_is_not_temporary() {
        let err = TunnelError::ListenerClosed;
        assert!(err.is_closed());
        assert!(!err.is_temporary());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_predicates() {
        assert!(TunnelError::Timeout.is_timeout());
        assert!(TunnelError::Timeout.is_temporary());

        let io = TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        ));
        assert!(io.is_timeout());
        assert!(io.is_temporary());
        assert!(!TunnelError::NotActive.is_timeout());
    }

    #[test]
    fn test_error_display() {
        let err = TunnelError::UnexpectedResponse("HTTP/1.0 504 Gateway Timeout".to_string());
        assert!(err.to_string().contains("504"));
        assert_eq!(TunnelError::EmptyName.to_string(), "Tunnel name is empty");
    }
}
