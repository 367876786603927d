use crisis_domain::{AppState, ResourceRef, SessionId, TimelineRecord};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Request bodies above this size are refused by the server.
pub const MAX_BODY_BYTES: usize = 1_000_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub session_id: SessionId,
    pub state: AppState,
    /// False when `state` is the default session rather than a stored record.
    pub exists: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStateRequest {
    pub session_id: SessionId,
    /// Kept untyped so the server can report structural problems as 400s.
    pub state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_op_id: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStateResponse {
    pub ok: bool,
    pub session_id: SessionId,
    pub version: u64,
    pub updated_at: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResponse {
    pub session_id: SessionId,
    pub records: Vec<TimelineRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceListResponse {
    pub session_id: SessionId,
    pub resources: Vec<ResourceRef>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub protocol_version: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WsClientMessage {
    Hello {
        protocol_version: u32,
        #[serde(default)]
        last_seen_version: Option<u64>,
    },
    Ping,
    Submit {
        request_id: String,
        state: serde_json::Value,
        #[serde(default)]
        base_version: Option<u64>,
        #[serde(default)]
        client_op_id: Option<String>,
    },
    /// Clears the session to the default state in place.
    Reset { request_id: String },
    /// Raw export document; validated before anything is replaced.
    Import {
        request_id: String,
        document: serde_json::Value,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WsServerMessage {
    Hello {
        protocol_version: u32,
        session_id: SessionId,
        state: Box<AppState>,
    },
    Pong,
    StateChanged {
        session_id: SessionId,
        state: Box<AppState>,
    },
    Ack {
        request_id: String,
        version: u64,
        updated_at: String,
    },
    Error {
        request_id: Option<String>,
        message: String,
    },
}
