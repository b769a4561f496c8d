//! Bounded rendezvous queue of parked connections for one tunnel name
//!
//! Slots and ready items are each tracked by a semaphore so `put` and `get`
//! can wait with a timeout without holding the lock. Closing the semaphores
//! wakes every waiter with a closed result.

use crate::connection::TunnelConnection;
use dialback_proto::TunnelError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// A connection the queue refused to park, handed back to the caller
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ParkRejected {
    pub error: TunnelError,
    pub conn: TunnelConnection,
}

struct QueueState {
    parked: VecDeque<TunnelConnection>,
    closed: bool,
}

/// Parked connections for one name, delivered first-in first-out
pub struct RendezvousQueue {
    name: String,
    capacity: usize,
    state: Mutex<QueueState>,
    free_slots: Semaphore,
    ready: Semaphore,
}

impl RendezvousQueue {
    /// Create an open queue holding at most `capacity` connections (minimum 1)
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(QueueState {
                parked: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            free_slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of connections currently parked
    pub fn len(&self) -> usize {
        self.lock().parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park a connection, waiting up to `timeout` for a free slot
    ///
    /// On failure the connection is returned inside [`ParkRejected`] with
    /// `Overflow` if no slot freed up in time, or `NotActive` if the queue
    /// is closed.
    pub async fn put(
        &self,
        conn: TunnelConnection,
        timeout: Duration,
    ) -> Result<(), ParkRejected> {
        let permit = match tokio::time::timeout(timeout, self.free_slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ParkRejected {
                    error: TunnelError::NotActive,
                    conn,
                })
            }
            Err(_) => {
                return Err(ParkRejected {
                    error: TunnelError::Overflow,
                    conn,
                })
            }
        };

        {
            let mut state = self.lock();
            if state.closed {
                return Err(ParkRejected {
                    error: TunnelError::NotActive,
                    conn,
                });
            }
            permit.forget();
            state.parked.push_back(conn);
        }
        self.ready.add_permits(1);

        Ok(())
    }

    /// Take the oldest parked connection, waiting up to `timeout`
    pub async fn get(&self, timeout: Duration) -> Result<TunnelConnection, TunnelError> {
        let permit = match tokio::time::timeout(timeout, self.ready.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TunnelError::NotActive),
            Err(_) => return Err(TunnelError::Timeout),
        };
        permit.forget();

        // Empty only if close() drained the queue after our permit was granted
        let conn = self.lock().parked.pop_front();
        match conn {
            Some(conn) => {
                self.free_slots.add_permits(1);
                Ok(conn)
            }
            None => Err(TunnelError::NotActive),
        }
    }

    /// Close the queue, shutting down every parked connection
    ///
    /// Returns how many connections were drained. Later calls are no-ops.
    pub async fn close(&self) -> usize {
        let drained: Vec<TunnelConnection> = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            self.free_slots.close();
            self.ready.close();
            state.parked.drain(..).collect()
        };

        let count = drained.len();
        for conn in drained {
            conn.terminate().await;
        }

        debug!(name = %self.name, drained = count, "Closed rendezvous queue");
        count
    }
}

impl std::fmt::Debug for RendezvousQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RendezvousQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("parked", &state.parked.len())
            .field("closed", &state.closed)
            .finish()
    }
}
