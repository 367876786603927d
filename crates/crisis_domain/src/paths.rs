use crate::SessionId;
use std::path::{Path, PathBuf};

pub const CRISIS_DATA_DIR_ENV: &str = "CRISIS_DATA_DIR";
pub const CRISIS_STORE_ENV: &str = "CRISIS_STORE";
pub const CRISIS_SERVER_ADDR_ENV: &str = "CRISIS_SERVER_ADDR";
pub const CRISIS_WEB_DIST_DIR_ENV: &str = "CRISIS_WEB_DIST_DIR";

/// Key used by the single-writer local session variant.
pub const LOCAL_SESSION_KEY: &str = "crisis_state";

pub fn sessions_root(data_root: &Path) -> PathBuf {
    data_root.join("sessions")
}

pub fn resources_root(data_root: &Path) -> PathBuf {
    data_root.join("resources")
}

pub fn sqlite_path(data_root: &Path) -> PathBuf {
    data_root.join("crisis.db")
}

pub fn session_state_path(data_root: &Path, session_id: &SessionId) -> PathBuf {
    sessions_root(data_root).join(format!("{}.json", session_id.as_str()))
}

pub fn session_resources_dir(data_root: &Path, session_id: &SessionId) -> PathBuf {
    resources_root(data_root).join(session_id.as_str())
}

pub fn offline_queue_path(client_root: &Path) -> PathBuf {
    client_root.join("offline-queue.json")
}

pub fn session_identity_path(client_root: &Path) -> PathBuf {
    client_root.join("session-id")
}
