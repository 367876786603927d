use crate::SessionId;
use serde::{Deserialize, Serialize};

/// Uploaded resource bytes are capped; larger files belong in a document system.
pub const RESOURCE_MAX_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredState {
    pub json: String,
    pub updated_at_unix_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ResourceUpload {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub created_at_unix_ms: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub id: String,
    pub session_id: SessionId,
    pub name: String,
    pub mime: String,
    pub byte_len: u64,
    pub created_at_unix_ms: u64,
}

/// Keyed storage of session documents and their uploaded files.
///
/// Implementations are blocking; async callers go through `spawn_blocking`.
pub trait SessionStore: Send + Sync {
    fn load_state(&self, session_id: &SessionId) -> Result<Option<StoredState>, String>;

    fn save_state(&self, session_id: &SessionId, state: StoredState) -> Result<(), String>;

    /// Returns whether a record existed.
    fn delete_state(&self, session_id: &SessionId) -> Result<bool, String>;

    fn store_resource(
        &self,
        session_id: &SessionId,
        upload: ResourceUpload,
    ) -> Result<ResourceRef, String>;

    fn list_resources(&self, session_id: &SessionId) -> Result<Vec<ResourceRef>, String>;

    fn load_resource(
        &self,
        session_id: &SessionId,
        resource_id: &str,
    ) -> Result<Option<(ResourceRef, Vec<u8>)>, String>;

    /// Returns the number of removed resources.
    fn delete_resources(&self, session_id: &SessionId) -> Result<usize, String>;
}
