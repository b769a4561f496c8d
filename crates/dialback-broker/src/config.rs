//! Broker configuration

use dialback_proto::DEFAULT_REGISTRATION_PATH;
use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Path registrations must target (e.g., "/tunnel")
    pub registration_path: String,
    /// Maximum parked connections per name
    pub queue_capacity: usize,
    /// How long a registration waits for a free slot before answering 504
    pub registration_timeout: Duration,
    /// Upper bound for a `timeout` query parameter on a registration
    pub max_registration_timeout: Duration,
    /// How long a dial waits for a parked connection
    pub dial_timeout: Duration,
    /// How long an inbound connection may take to send its request line
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            registration_path: DEFAULT_REGISTRATION_PATH.to_string(),
            queue_capacity: 100,
            registration_timeout: Duration::from_secs(2),
            max_registration_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    pub fn with_registration_path(mut self, path: impl Into<String>) -> Self {
        self.registration_path = path.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_max_registration_timeout(mut self, timeout: Duration) -> Self {
        self.max_registration_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
