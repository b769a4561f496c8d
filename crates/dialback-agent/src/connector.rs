//! Listener-shaped agent connector
//!
//! A pool of workers keeps outbound registrations parked at the broker. When a
//! consumer dials our name, the worker holding that registration offers the
//! now-live connection to [`AgentConnector::accept`], exactly like an inbound
//! connection on a regular listener.
//!
//! A connection stays owned by its worker until an `accept()` caller takes it
//! out of the offer. Taking is synchronous, so a cancelled `accept()` never
//! loses a connection, and an offer nobody takes is withdrawn and closed when
//! the handoff timeout runs out.

use crate::config::{clamp_threads, AgentConfig};
use crate::dial;
use dialback_proto::{Address, TunnelError, TRANSPORT_TCP};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failures are reported for the first three of every twenty
fn should_log(failures: u64) -> bool {
    failures > 0 && (failures - 1) % 20 < 3
}

/// Consecutive registration failures of one worker
#[derive(Debug, Default)]
struct FailureCounter {
    failures: u64,
}

impl FailureCounter {
    /// Count a failure, returning whether it should be logged
    fn record_failure(&mut self) -> bool {
        self.failures += 1;
        should_log(self.failures)
    }

    fn record_success(&mut self) {
        self.failures = 0;
    }
}

/// A dialed connection waiting for an `accept()` caller
struct Offer {
    stream: std::sync::Mutex<Option<TcpStream>>,
    taken: Notify,
}

impl Offer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: std::sync::Mutex::new(Some(stream)),
            taken: Notify::new(),
        }
    }

    fn take(&self) -> Option<TcpStream> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Withdraws the offer when the worker stops waiting on it
struct OfferGuard(Arc<Offer>);

impl OfferGuard {
    /// True if an `accept()` caller took the stream
    fn withdraw(self) -> bool {
        self.0.take().is_none()
    }
}

impl Drop for OfferGuard {
    fn drop(&mut self) {
        drop(self.0.take());
    }
}

/// Offer `stream` to `accept()` until `deadline`
async fn offer(
    offers: &mpsc::UnboundedSender<Arc<Offer>>,
    stream: TcpStream,
    deadline: Instant,
) -> bool {
    let offer = Arc::new(Offer::new(stream));
    let guard = OfferGuard(offer.clone());
    if offers.send(offer.clone()).is_err() {
        return false;
    }

    let _ = tokio::time::timeout_at(deadline, offer.taken.notified()).await;
    guard.withdraw()
}

/// Accepts tunnel connections that arrive through a broker
///
/// Dropping the connector stops its workers, same as [`AgentConnector::close`].
pub struct AgentConnector {
    address: Address,
    threads: usize,
    offers: Mutex<mpsc::UnboundedReceiver<Arc<Offer>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl AgentConnector {
    /// Start `threads` workers registering at `path` on the broker at `hostport`
    ///
    /// Zero threads selects the default, and the count is capped. Only the
    /// `tcp` transport is supported. Must be called within a Tokio runtime.
    pub fn listen(
        threads: usize,
        transport: &str,
        hostport: &str,
        path: &str,
    ) -> Result<Self, TunnelError> {
        let config = AgentConfig::from_address(Address::new(transport, hostport, path))
            .with_threads(threads);
        Self::listen_with_config(config)
    }

    pub fn listen_with_config(config: AgentConfig) -> Result<Self, TunnelError> {
        if config.address.transport() != TRANSPORT_TCP {
            return Err(TunnelError::UnsupportedTransport(
                config.address.transport().to_string(),
            ));
        }

        let threads = clamp_threads(config.threads);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let address = config.address.clone();
        let config = Arc::new(config);

        info!(address = %address, threads, "Starting agent connector");

        for worker in 0..threads {
            let config = config.clone();
            let offers = tx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_worker(worker, config, offers, shutdown).await;
            });
        }

        Ok(Self {
            address,
            threads,
            offers: Mutex::new(rx),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next tunnel connection
    ///
    /// The stream is positioned at the first byte the consumer sends. Fails
    /// with [`TunnelError::ListenerClosed`] once the connector is closed.
    /// Cancel-safe: dropping the future never loses a connection.
    pub async fn accept(&self) -> Result<TcpStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ListenerClosed);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::ListenerClosed),
            stream = self.next_offer() => stream,
        }
    }

    async fn next_offer(&self) -> Result<TcpStream, TunnelError> {
        let mut offers = self.offers.lock().await;
        while let Some(offer) = offers.recv().await {
            // Withdrawn offers are empty
            if let Some(stream) = offer.take() {
                offer.taken.notify_one();
                return Ok(stream);
            }
        }
        Err(TunnelError::ListenerClosed)
    }

    /// Stop all workers and fail pending and future `accept()` calls
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(address = %self.address, "Closing agent connector");
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> &Address {
        &self.address
    }

    /// Number of workers after clamping
    pub fn worker_count(&self) -> usize {
        self.threads
    }
}

impl Drop for AgentConnector {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    worker: usize,
    config: Arc<AgentConfig>,
    offers: mpsc::UnboundedSender<Arc<Offer>>,
    shutdown: CancellationToken,
) {
    let mut counter = FailureCounter::default();

    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = dial::connect(&config) => result,
        };

        match result {
            Ok(stream) => {
                counter.record_success();
                let deadline = Instant::now() + config.handoff_timeout;
                let delivered = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    delivered = offer(&offers, stream, deadline) => delivered,
                };
                if !delivered {
                    debug!(worker, "No accept() caller in time, dropped tunnel connection");
                }
            }
            Err(e) => {
                if counter.record_failure() {
                    warn!(
                        worker,
                        address = %config.address,
                        failures = counter.failures,
                        "Failed to register with broker: {}",
                        e
                    );
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }

    debug!(worker, "Agent worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialback_proto::{is_head_complete, registration_request, success_response};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !is_head_complete(&head) {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn unreachable_broker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_should_log_samples_failures() {
        let logged: Vec<u64> = (1..=45).filter(|n| should_log(*n)).collect();
        assert_eq!(logged, vec![1, 2, 3, 21, 22, 23, 41, 42, 43]);
        assert!(!should_log(0));
    }

    #[test]
    fn test_failure_counter_resets_after_success() {
        let mut counter = FailureCounter::default();
        let logged: Vec<bool> = (0..4).map(|_| counter.record_failure()).collect();
        assert_eq!(logged, vec![true, true, true, false]);

        counter.record_success();
        assert_eq!(counter.failures, 0);
        assert!(counter.record_failure());
        assert_eq!(counter.failures, 1);
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let err = AgentConnector::listen(1, "udp", "127.0.0.1:1", "/tunnel?name=x")
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::UnsupportedTransport(t) if t == "udp"));
    }

    #[tokio::test]
    async fn test_thread_count_is_clamped() {
        let broker = unreachable_broker().await;
        let connector = AgentConnector::listen(0, "tcp", &broker, "/tunnel?name=x").unwrap();
        assert_eq!(connector.worker_count(), 10);
        connector.close();

        let connector = AgentConnector::listen(1000, "tcp", &broker, "/tunnel?name=x").unwrap();
        assert_eq!(connector.worker_count(), 100);
        connector.close();
    }

    #[tokio::test]
    async fn test_accept_after_close_fails() {
        let broker = unreachable_broker().await;
        let connector = AgentConnector::listen(1, "tcp", &broker, "/tunnel?name=x").unwrap();

        connector.close();
        connector.close();

        assert!(connector.is_closed());
        assert!(matches!(
            connector.accept().await,
            Err(TunnelError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let broker = unreachable_broker().await;
        let connector =
            Arc::new(AgentConnector::listen(2, "tcp", &broker, "/tunnel?name=x").unwrap());

        let pending = tokio::spawn({
            let connector = connector.clone();
            async move { connector.accept().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        connector.close();
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_accept_delivers_dialed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let connector =
            AgentConnector::listen(1, "tcp", &broker_addr, "/tunnel?name=test").unwrap();
        assert_eq!(
            connector.addr().to_string(),
            format!("tunnel:tcp://{}/tunnel?name=test", broker_addr)
        );

        let (mut parked, _) = listener.accept().await.unwrap();
        assert_eq!(
            read_request(&mut parked).await,
            registration_request("/tunnel?name=test")
        );

        let mut wire = success_response();
        wire.extend_from_slice(b"1234567890");
        parked.write_all(&wire).await.unwrap();

        let mut stream = tokio::time::timeout(Duration::from_secs(5), connector.accept())
            .await
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1234567890");

        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        parked.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        connector.close();
    }

    #[tokio::test]
    async fn test_unclaimed_connection_is_closed_after_handoff_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let config = AgentConfig::new(broker_addr, "idle")
            .with_threads(1)
            .with_handoff_timeout(Duration::from_millis(100));
        let connector = AgentConnector::listen_with_config(config).unwrap();

        let (mut parked, _) = listener.accept().await.unwrap();
        read_request(&mut parked).await;
        parked.write_all(&success_response()).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), parked.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        // The worker registers again after dropping the connection
        let (mut next, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            read_request(&mut next).await,
            registration_request("/tunnel?name=idle")
        );

        connector.close();
    }

    #[tokio::test]
    async fn test_close_drops_parked_registrations() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let connector =
            AgentConnector::listen(1, "tcp", &broker_addr, "/tunnel?name=x").unwrap();

        let (mut parked, _) = listener.accept().await.unwrap();
        read_request(&mut parked).await;

        connector.close();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), parked.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_abandoned_accepts_do_not_lose_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let connector =
            AgentConnector::listen(1, "tcp", &broker_addr, "/tunnel?name=test").unwrap();

        for _ in 0..20 {
            let attempt =
                tokio::time::timeout(Duration::from_millis(5), connector.accept()).await;
            assert!(attempt.is_err());
        }

        let (mut parked, _) = listener.accept().await.unwrap();
        read_request(&mut parked).await;
        let mut wire = success_response();
        wire.extend_from_slice(b"first");
        parked.write_all(&wire).await.unwrap();

        let mut stream = tokio::time::timeout(Duration::from_secs(5), connector.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        connector.close();
    }

    #[tokio::test]
    async fn test_offer_taken_by_later_accept_within_handoff_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let config = AgentConfig::new(broker_addr, "late")
            .with_threads(1)
            .with_handoff_timeout(Duration::from_secs(5));
        let connector = AgentConnector::listen_with_config(config).unwrap();

        let (mut parked, _) = listener.accept().await.unwrap();
        read_request(&mut parked).await;
        let mut wire = success_response();
        wire.extend_from_slice(b"x");
        parked.write_all(&wire).await.unwrap();

        // Nobody is accepting while the worker finishes its handshake
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = tokio::time::timeout(Duration::from_secs(5), connector.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        connector.close();
    }
}
