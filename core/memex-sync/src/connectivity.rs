//! Connectivity observation.
//!
//! The host platform decides how it learns about network transitions
//! (OS callbacks, polling, a browser event bridge). It reports them through
//! [`ConnectivityMonitor`]; the core only asks "online?" and listens for
//! changes.

use crate::content_store::{with_timeout, ContentStore};
use crate::error::{SyncError, SyncResult};
use memex_types::Cid;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Callback fired with the new online state on every transition.
pub type ConnectivityCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Observes the process-wide online/offline signal.
pub trait ConnectivityMonitor: Send + Sync {
    /// Whether the network is currently believed to be up.
    fn is_online(&self) -> bool;

    /// Registers a callback for online/offline transitions.
    fn on_change(&self, callback: ConnectivityCallback);
}

/// A monitor whose state is set explicitly by the host.
pub struct ManualConnectivity {
    state: watch::Sender<bool>,
    callbacks: Mutex<Vec<ConnectivityCallback>>,
}

impl ManualConnectivity {
    /// Creates a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Records a transition. Callbacks fire only when the state changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }
        info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        if let Ok(callbacks) = self.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(online);
            }
        }
    }

    /// A receiver that observes every transition.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn on_change(&self, callback: ConnectivityCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }
}

/// Checks both gates that guard network work: the online signal, then a
/// reachability probe against the content gateway.
///
/// Any answer to the probe (present or absent) counts as reachable; only a
/// failed or timed-out call means the gateway is down.
pub async fn check_reachability(
    monitor: &dyn ConnectivityMonitor,
    store: &Arc<dyn ContentStore>,
    probe_cid: &Cid,
    timeout: Duration,
) -> SyncResult<()> {
    if !monitor.is_online() {
        return Err(SyncError::Offline);
    }
    match with_timeout(timeout, store.head_check(probe_cid)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            debug!("Gateway probe failed: {}", e);
            Err(SyncError::GatewayUnreachable)
        }
    }
}
