use tokio::sync::watch;
use tracing::info;

/// Snapshot published to subscribers.
///
/// A watch channel only keeps the latest value, so an offline/online flip
/// between two reads would be invisible in `online` alone. `reconnects`
/// counts `false -> true` edges and never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub online: bool,
    pub reconnects: u64,
}

/// Online/offline flag owned by the host.
///
/// A `false -> true` edge is the "reconnected" signal that triggers offline
/// queue replay.
#[derive(Debug)]
pub struct Connectivity {
    state: watch::Sender<ConnectivityState>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            online,
            reconnects: 0,
        });
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    pub fn reconnects(&self) -> u64 {
        self.state.borrow().reconnects
    }

    /// Returns true when this call brought the gateway back online.
    pub fn set_online(&self, online: bool) -> bool {
        let mut reconnected = false;
        let changed = self.state.send_if_modified(|current| {
            if current.online == online {
                return false;
            }
            if online {
                reconnected = true;
                current.reconnects = current.reconnects.wrapping_add(1);
            }
            current.online = online;
            true
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        reconnected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
