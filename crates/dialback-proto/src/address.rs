//! Tunnel endpoint addressing

use std::fmt;

/// Identifies a tunnel endpoint: the transport network, the broker's
/// `host:port`, and the request target used for routing at the broker.
///
/// Only used for diagnostics and for deriving dial targets; it is never
/// parsed back from its string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    transport: String,
    hostport: String,
    path: String,
}

impl Address {
    pub fn new(
        transport: impl Into<String>,
        hostport: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            transport: transport.into(),
            hostport: hostport.into(),
            path: path.into(),
        }
    }

    /// Build an address whose path registers under `name` at `base_path`
    ///
    /// The name is form-encoded into the `name` query parameter.
    pub fn for_name(
        transport: impl Into<String>,
        hostport: impl Into<String>,
        base_path: &str,
        name: &str,
    ) -> Self {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("name", name)
            .finish();
        Self::new(transport, hostport, format!("{}?{}", base_path, query))
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tunnel:{}://{}{}",
            self.transport, self.hostport, self.path
        )
    }
}
