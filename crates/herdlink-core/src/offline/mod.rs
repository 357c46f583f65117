//! Offline support: the connectivity flag and the durable write queue.

mod connectivity;
mod queue;

pub use connectivity::{Connectivity, ConnectivityState};
pub use queue::{OfflineQueue, OfflineQueueItem, ReplayReport};
