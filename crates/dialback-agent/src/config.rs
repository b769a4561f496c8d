//! Agent connector configuration

use dialback_proto::{Address, DEFAULT_REGISTRATION_PATH, TRANSPORT_TCP};
use std::time::Duration;

/// Worker count used when zero is requested
pub const DEFAULT_THREADS: usize = 10;

/// Upper bound on persistent workers per connector
pub const MAX_THREADS: usize = 100;

/// Map a requested worker count onto `[1, MAX_THREADS]`, treating 0 as the default
pub fn clamp_threads(threads: usize) -> usize {
    if threads == 0 {
        DEFAULT_THREADS
    } else {
        threads.clamp(1, MAX_THREADS)
    }
}

/// Configuration for an [`crate::AgentConnector`]
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker endpoint and registration target
    pub address: Address,
    /// Number of persistent workers, each keeping one connection parked
    pub threads: usize,
    /// Pause after a failed connection attempt
    pub retry_delay: Duration,
    /// How long a dialed connection waits for an `accept()` caller
    pub handoff_timeout: Duration,
    /// Bound on establishing the TCP connection to the broker
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Register `name` at the broker's default registration path
    pub fn new(broker_addr: impl Into<String>, name: &str) -> Self {
        Self::from_address(Address::for_name(
            TRANSPORT_TCP,
            broker_addr,
            DEFAULT_REGISTRATION_PATH,
            name,
        ))
    }

    pub fn from_address(address: Address) -> Self {
        Self {
            address,
            threads: DEFAULT_THREADS,
            retry_delay: Duration::from_secs(1),
            handoff_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
