//! Network availability contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Receives connectivity changes pushed by a [`ConnectivitySource`].
pub trait ConnectivityListener: Send + Sync {
    fn on_network_change(&self, connected: bool);
}

/// Reports whether network-gated jobs may run.
pub trait ConnectivitySource: Send + Sync + core::fmt::Debug {
    fn is_connected(&self) -> bool;

    /// Install (or clear, with `None`) the push listener.
    ///
    /// Returns `false` when the source cannot push; the manager then relies on
    /// polling alone.
    fn set_listener(&self, _listener: Option<Arc<dyn ConnectivityListener>>) -> bool {
        false
    }
}

/// A source that is never offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

impl ConnectivitySource for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Connectivity flipped by hand, with push notifications.
#[derive(Default)]
pub struct ManualConnectivity {
    connected: AtomicBool,
    listener: Mutex<Option<Arc<dyn ConnectivityListener>>>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            listener: Mutex::new(None),
        }
    }

    /// Update the state. With `notify` set, the installed listener is told
    /// about the change; otherwise it is only seen on the next poll.
    pub fn set_connected(&self, connected: bool, notify: bool) {
        self.connected.store(connected, Ordering::Release);
        if !notify {
            return;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.on_network_change(connected);
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_listener(&self, listener: Option<Arc<dyn ConnectivityListener>>) -> bool {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = listener;
        true
    }
}

impl core::fmt::Debug for ManualConnectivity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManualConnectivity")
            .field("connected", &self.is_connected())
            .field("has_listener", &self.has_listener())
            .finish()
    }
}
