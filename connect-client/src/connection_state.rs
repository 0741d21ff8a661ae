//! Connection state store
//!
//! Holds the reachability state of the server together with a counter of
//! in-flight loading operations. `Loading` is reported only while that
//! counter is above zero. Any accepted transition resets the counter, so a
//! forced `ConnectionLost` in the middle of a loading stack cannot leave it
//! unbalanced.
//!
//! Listeners are kept as a set: registering the same listener twice still
//! yields one notification per transition. Listeners run synchronously on
//! the thread that caused the transition, after the store lock is released.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Connection state of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Server reachable, nothing in flight
    Connected,
    /// At least one request in flight
    Loading,
    /// Connection lost, reconnect in progress
    Reconnecting,
    /// Server unreachable
    ConnectionLost,
}

impl ConnectionState {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Loading => "LOADING",
            Self::Reconnecting => "RECONNECTING",
            Self::ConnectionLost => "CONNECTION_LOST",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Connected | Self::Loading)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Callback invoked with `(previous, next)` on every transition
pub type ConnectionStateListener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

struct StoreState {
    state: ConnectionState,
    loading_count: usize,
    listeners: Vec<ConnectionStateListener>,
}

/// A pending notification, delivered after the lock is dropped
struct Transition {
    previous: ConnectionState,
    next: ConnectionState,
    listeners: Vec<ConnectionStateListener>,
}

impl Transition {
    fn notify(self) {
        debug!(from = %self.previous, to = %self.next, "Connection state changed");
        for listener in &self.listeners {
            listener(self.previous, self.next);
        }
    }
}

/// Store for the application connection state
pub struct ConnectionStateStore {
    inner: Mutex<StoreState>,
}

impl ConnectionStateStore {
    /// Create a store starting in the given state
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            inner: Mutex::new(StoreState {
                state: initial,
                loading_count: 0,
                listeners: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of unmatched `loading_started()` calls
    pub fn loading_count(&self) -> usize {
        self.lock().loading_count
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn is_offline(&self) -> bool {
        self.state().is_offline()
    }

    /// Force the state. Setting the current value again is a no-op.
    ///
    /// Forcing `Loading` counts as one pending load, so a matching
    /// `loading_finished()` leaves it again.
    pub fn set_state(&self, next: ConnectionState) {
        let transition = {
            let mut inner = self.lock();
            let transition = Self::transition(&mut inner, next);
            if transition.is_some() && next == ConnectionState::Loading {
                inner.loading_count = 1;
            }
            transition
        };
        if let Some(transition) = transition {
            transition.notify();
        }
    }

    /// A loading operation started
    pub fn loading_started(&self) {
        let transition = {
            let mut inner = self.lock();
            let transition = Self::transition(&mut inner, ConnectionState::Loading);
            inner.loading_count += 1;
            transition
        };
        if let Some(transition) = transition {
            transition.notify();
        }
    }

    /// A loading operation finished with a response
    pub fn loading_finished(&self) {
        self.decrease_loading_count(ConnectionState::Connected);
    }

    /// A loading operation failed to reach the server
    pub fn loading_failed(&self) {
        self.decrease_loading_count(ConnectionState::ConnectionLost);
    }

    /// Register a listener. Registering the same `Arc` twice has no effect.
    pub fn add_state_change_listener(&self, listener: ConnectionStateListener) {
        let mut inner = self.lock();
        if !inner.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            inner.listeners.push(listener);
        }
    }

    pub fn remove_state_change_listener(&self, listener: &ConnectionStateListener) {
        self.lock().listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn decrease_loading_count(&self, final_state: ConnectionState) {
        let transition = {
            let mut inner = self.lock();
            if inner.loading_count == 0 {
                return;
            }
            inner.loading_count -= 1;
            if inner.loading_count == 0 {
                Self::transition(&mut inner, final_state)
            } else {
                None
            }
        };
        if let Some(transition) = transition {
            transition.notify();
        }
    }

    fn transition(inner: &mut StoreState, next: ConnectionState) -> Option<Transition> {
        if inner.state == next {
            return None;
        }
        let previous = inner.state;
        inner.state = next;
        inner.loading_count = 0;
        Some(Transition {
            previous,
            next,
            listeners: inner.listeners.clone(),
        })
    }
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new(ConnectionState::Connected)
    }
}

impl std::fmt::Debug for ConnectionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectionStateStore")
            .field("state", &inner.state)
            .field("loading_count", &inner.loading_count)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
