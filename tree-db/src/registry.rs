//! Registry of live client connections.
//!
//! Each connection registers on entry and receives a [`Registration`] guard
//! carrying its own cancellation token. Dropping the guard unregisters the
//! connection, so every exit path of a connection task, including a task that
//! is aborted mid-await, leaves the registry consistent.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    // Mirrors `state.connections.len()`, updated under the state lock.
    live: watch::Sender<usize>,
    next_id: AtomicU64,
}

struct RegistryState {
    connections: HashMap<ConnectionId, CancellationToken>,
    accepting: bool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            state: Mutex::new(RegistryState {
                connections: HashMap::new(),
                accepting: true,
            }),
            live,
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, or returns `None` once the registry has
    /// been closed for shutdown.
    pub fn register(self: &Arc<Self>) -> Option<Registration> {
        let mut state = self.state.lock();
        if !state.accepting {
            return None;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        state.connections.insert(id, token.clone());
        let live = state.connections.len();
        self.live.send_replace(live);
        debug!(conn = %id, live, "connection registered");

        Some(Registration {
            id,
            token,
            registry: Arc::clone(self),
        })
    }

    fn unregister(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        if state.connections.remove(&id).is_some() {
            let live = state.connections.len();
            self.live.send_replace(live);
            debug!(conn = %id, live, "connection unregistered");
        }
    }

    /// Requests cancellation of every registered connection and returns how
    /// many were signalled. Connections stay registered until they exit.
    pub fn cancel_all(&self) -> usize {
        let state = self.state.lock();
        for token in state.connections.values() {
            token.cancel();
        }
        state.connections.len()
    }

    /// Stops accepting registrations and cancels everything already
    /// registered, in one step. No connection can register between the two.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.accepting = false;
        for token in state.connections.values() {
            token.cancel();
        }
        state.connections.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    /// Resolves once no connection is registered.
    pub async fn wait_for_drain(&self) {
        let mut live = self.live.subscribe();
        // Only errors if the sender is dropped, and `self` owns it.
        let _ = live.wait_for(|count| *count == 0).await;
    }
}

/// Proof of membership in a [`ConnectionRegistry`]. Unregisters on drop.
pub struct Registration {
    id: ConnectionId,
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
