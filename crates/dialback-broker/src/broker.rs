//! Broker: rendezvous between parked agent connections and dialers
//!
//! Agents park raw connections under a logical name through
//! [`Broker::serve_registration`]. Consumers call [`Broker::dial`] to claim
//! one; the broker then writes the canned success response the agent is
//! blocked on and hands the connection over as an opaque byte stream.

use crate::config::BrokerConfig;
use crate::connection::TunnelConnection;
use crate::queue::RendezvousQueue;
use dialback_proto::{success_response, TunnelError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback fired with the tunnel name before a dial starts waiting
///
/// Lets the host nudge the target agent through some side channel.
pub type DialSignal = Arc<dyn Fn(&str) + Send + Sync>;

/// Rendezvous broker
pub struct Broker {
    pub(crate) config: BrokerConfig,
    queues: RwLock<HashMap<String, Arc<RendezvousQueue>>>,
    on_dial: Option<DialSignal>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        info!(
            path = %config.registration_path,
            queue_capacity = config.queue_capacity,
            "Creating tunnel broker"
        );
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
            on_dial: None,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install a callback fired on every dial
    pub fn with_dial_signal<F>(mut self, signal: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_dial = Some(Arc::new(signal));
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Broker::close`] has been called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Look up the queue for `name`, creating it on first use
    ///
    /// Queues are never removed; a name stays known for the broker's lifetime.
    /// Creation checks `closed` under the map's write lock, the same lock
    /// [`Broker::close`] snapshots the queues under, so no queue can appear
    /// after that snapshot.
    pub(crate) fn queue(&self, name: &str) -> Result<Arc<RendezvousQueue>, TunnelError> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Ok(queue.clone());
        }

        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return Err(TunnelError::NotActive);
        }
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name = %name, "Created rendezvous queue");
                Arc::new(RendezvousQueue::new(name, self.config.queue_capacity))
            })
            .clone();
        Ok(queue)
    }

    /// Names observed so far, by registration or by dial
    pub fn queue_names(&self) -> Vec<String> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Connections currently parked under `name`
    pub fn parked(&self, name: &str) -> usize {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Claim a parked connection for `name` using the configured dial timeout
    pub async fn dial(&self, name: &str) -> Result<TunnelConnection, TunnelError> {
        self.dial_timeout(name, self.config.dial_timeout).await
    }

    /// Claim a parked connection for `name`, waiting at most `timeout`
    ///
    /// An unknown name and a slow agent look the same: both end in
    /// `Timeout`. Parked connections whose agent has gone away are skipped
    /// within the same deadline.
    pub async fn dial_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<TunnelConnection, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::NotActive);
        }
        if name.is_empty() {
            return Err(TunnelError::EmptyName);
        }

        if let Some(signal) = &self.on_dial {
            signal(name);
        }

        debug!(name = %name, timeout = ?timeout, "Dialing tunnel");

        let queue = self.queue(name)?;
        let deadline = Instant::now() + timeout;
        let response = success_response();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut conn = queue.get(remaining).await.map_err(|e| {
                if e.is_timeout() {
                    debug!(name = %name, "Dial timed out");
                }
                e
            })?;

            let acknowledged = match conn.write_all(&response).await {
                Ok(()) => conn.flush().await,
                Err(e) => Err(e),
            };

            match acknowledged {
                Ok(()) => {
                    info!(name = %name, peer = %conn.remote_addr(), "Tunnel dialed");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(
                        name = %name,
                        peer = %conn.remote_addr(),
                        "Parked connection is gone, trying next: {}", e
                    );
                }
            }
        }
    }

    /// Stop accepting registrations and dials, closing every queue
    ///
    /// Parked connections are shut down. Later calls are no-ops.
    pub async fn close(&self) {
        let queues: Vec<Arc<RendezvousQueue>> = {
            let queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            queues.values().cloned().collect()
        };
        self.shutdown.cancel();

        let mut drained = 0;
        for queue in &queues {
            drained += queue.close().await;
        }

        info!(
            queues = queues.len(),
            drained = drained,
            "Tunnel broker closed"
        );
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialback_proto::CANNED_BODY;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    const SHORT: Duration = Duration::from_millis(50);

    async fn park(broker: &Broker, name: &str, tag: &str) -> tokio::io::DuplexStream {
        let (near, far) = tokio::io::duplex(256);
        broker
            .queue(name)
            .unwrap()
            .put(TunnelConnection::new(near, tag), SHORT)
            .await
            .unwrap();
        far
    }

    #[tokio::test]
    async fn test_dial_sends_success_response_then_streams() {
        let broker = Broker::default();
        let mut agent = park(&broker, "svc", "agent-1").await;

        let mut conn = broker.dial_timeout("svc", SHORT).await.unwrap();
        assert_eq!(conn.remote_addr(), "agent-1");

        let expected = success_response();
        let mut head = vec![0u8; expected.len()];
        agent.read_exact(&mut head).await.unwrap();
        assert_eq!(head, expected);
        assert!(head.ends_with(CANNED_BODY));

        conn.write_all(b"payload").await.unwrap();
        let mut buf = [0u8; 7];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn test_dial_unregistered_name_times_out_within_margin() {
        let broker = Broker::default();
        let timeout = Duration::from_millis(200);

        let started = Instant::now();
        let result = broker.dial_timeout("nobody", timeout).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(TunnelError::Timeout)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
        assert_eq!(broker.queue_names(), vec!["nobody".to_string()]);
    }

    #[tokio::test]
    async fn test_dial_after_close_is_not_active() {
        let broker = Broker::default();
        broker.close().await;
        assert!(matches!(
            broker.dial("svc").await,
            Err(TunnelError::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_dial_empty_name() {
        let broker = Broker::default();
        assert!(matches!(
            broker.dial_timeout("", SHORT).await,
            Err(TunnelError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn test_dial_signal_fires_before_wait() {
        let hits = Arc::new(AtomicUsize::new(0));
        let broker = {
            let hits = hits.clone();
            Broker::default().with_dial_signal(move |name| {
                assert_eq!(name, "svc");
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let _ = broker.dial_timeout("svc", SHORT).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_skips_dead_parked_connection() {
        let broker = Broker::default();
        let dead = park(&broker, "svc", "dead").await;
        drop(dead);
        let _alive = park(&broker, "svc", "alive").await;

        let conn = broker.dial_timeout("svc", SHORT).await.unwrap();
        assert_eq!(conn.remote_addr(), "alive");
        assert_eq!(broker.parked("svc"), 0);
    }

    #[tokio::test]
    async fn test_no_queue_created_after_close() {
        let broker = Broker::default();
        let _agent = park(&broker, "before", "agent-1").await;

        broker.close().await;

        assert!(matches!(broker.queue("after"), Err(TunnelError::NotActive)));
        assert_eq!(broker.queue_names(), vec!["before".to_string()]);
        assert!(broker.queue("before").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_every_queue() {
        let broker = Broker::default();
        let mut peers = vec![
            park(&broker, "a", "a-1").await,
            park(&broker, "a", "a-2").await,
            park(&broker, "b", "b-1").await,
        ];
        assert_eq!(broker.parked("a"), 2);

        broker.close().await;
        broker.close().await;
        assert!(broker.is_closed());
        assert_eq!(broker.parked("a"), 0);
        assert_eq!(broker.parked("b"), 0);

        for far in peers.iter_mut() {
            let mut buf = Vec::new();
            assert_eq!(far.read_to_end(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_closed_future_resolves_after_close() {
        let broker = Arc::new(Broker::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.closed().await })
        };
        broker.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
