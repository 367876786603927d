use crate::{AppState, SessionId, new_item_id, time::now_unix_ms};
use serde::{Deserialize, Serialize};

pub const APP_STATE_TABLE: &str = "app_state";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upsert,
    Delete,
}

/// A mutation recorded while the remote store was unreachable.
///
/// `id` doubles as the idempotency key when the operation is replayed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    pub session_id: SessionId,
    pub table: String,
    pub operation: OperationKind,
    #[serde(default)]
    pub data: Option<AppState>,
    pub timestamp: u64,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingOperation {
    pub fn upsert(session_id: SessionId, state: AppState) -> Self {
        Self {
            id: new_item_id(),
            session_id,
            table: APP_STATE_TABLE.to_owned(),
            operation: OperationKind::Upsert,
            data: Some(state),
            timestamp: now_unix_ms(),
            attempts: 0,
        }
    }

    pub fn delete(session_id: SessionId) -> Self {
        Self {
            id: new_item_id(),
            session_id,
            table: APP_STATE_TABLE.to_owned(),
            operation: OperationKind::Delete,
            data: None,
            timestamp: now_unix_ms(),
            attempts: 0,
        }
    }
}
