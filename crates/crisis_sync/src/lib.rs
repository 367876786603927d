//! Client side of a crisis session: the local document, background saves, polling and
//! an offline queue that replays once the remote is reachable again.

mod engine;
mod identity;
mod local;
mod queue;
mod remote;
mod state;

#[cfg(test)]
mod testing;

pub use engine::{
    DEFAULT_POLL_INTERVAL, SyncConfig, SyncEngine, SyncError, SyncHandle, SyncSnapshot,
};
pub use identity::SessionIdentity;
pub use local::{LocalSession, spawn_autosave};
pub use queue::{OfflineQueue, ReplayReport, RetryPolicy, replay};
pub use remote::{HttpRemote, RemoteError, RemoteStore, RepositoryRemote};
pub use state::{ConflictPolicy, PendingSave, RemoteOutcome, SyncState};
