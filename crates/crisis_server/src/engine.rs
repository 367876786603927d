use crate::idempotency::{Begin, IdempotencyStore};
use crisis_api::SaveStateResponse;
use crisis_backend::{SaveAck, SaveError, SessionRepository};
use crisis_domain::time::now_rfc3339;
use crisis_domain::{
    AppState, LoadOutcome, ResourceRef, ResourceUpload, SessionId, parse_app_state,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(10 * 60);
const IDEMPOTENCY_MAX_ENTRIES: usize = 4096;

/// Identifies one realtime connection so it does not receive its own changes back.
pub type ConnectionId = u64;

#[derive(Clone, Debug)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub state: AppState,
    pub origin: Option<ConnectionId>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    Invalid(String),
    #[error("version conflict: expected {expected}, stored {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("{0}")]
    Store(String),
    #[error("engine unavailable")]
    Unavailable,
}

impl From<SaveError> for EngineError {
    fn from(err: SaveError) -> Self {
        match err {
            SaveError::Conflict { expected, actual } => Self::Conflict { expected, actual },
            SaveError::Invalid(err) => Self::Invalid(err.to_string()),
            SaveError::Store(message) => Self::Store(message),
        }
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    ops: IdempotencyStore<SaveStateResponse, EngineError>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.unwrap_or(Err(EngineError::Unavailable))
    }

    pub async fn load(&self, session_id: SessionId) -> Result<LoadOutcome, EngineError> {
        self.request(|reply| EngineCommand::Load { session_id, reply })
            .await
    }

    /// Validates and persists a full document. With `client_op_id` set, a replayed
    /// operation returns the first acknowledgement instead of writing again.
    pub async fn save(
        &self,
        session_id: SessionId,
        state: serde_json::Value,
        base_version: Option<u64>,
        client_op_id: Option<String>,
        origin: Option<ConnectionId>,
    ) -> Result<SaveStateResponse, EngineError> {
        let Some(op_id) = client_op_id else {
            return self
                .request(|reply| EngineCommand::Save {
                    session_id,
                    document: state.to_string(),
                    base_version,
                    origin,
                    reply,
                })
                .await;
        };

        let key = format!("{session_id}/{op_id}");
        match self.ops.begin(key.clone()).await {
            Begin::Done(ack) => {
                tracing::debug!(session_id = %session_id, op_id = %op_id, "replayed operation");
                return Ok(ack);
            }
            Begin::Wait(rx) => return rx.await.unwrap_or(Err(EngineError::Unavailable)),
            Begin::Owner => {}
        }

        // Runs detached so the entry is completed even when the caller goes away.
        let handle = self.clone();
        let owner = tokio::spawn(async move {
            let result = handle
                .request(|reply| EngineCommand::Save {
                    session_id,
                    document: state.to_string(),
                    base_version,
                    origin,
                    reply,
                })
                .await;
            handle.ops.complete(key, result.clone()).await;
            result
        });
        owner.await.unwrap_or(Err(EngineError::Unavailable))
    }

    /// Validates an exported document and replaces the session with it.
    pub async fn import(
        &self,
        session_id: SessionId,
        document: String,
        origin: Option<ConnectionId>,
    ) -> Result<SaveStateResponse, EngineError> {
        self.request(|reply| EngineCommand::Save {
            session_id,
            document,
            base_version: None,
            origin,
            reply,
        })
        .await
    }

    /// Clears the session to the default state, keeping its id.
    pub async fn clear(
        &self,
        session_id: SessionId,
        origin: Option<ConnectionId>,
    ) -> Result<SaveStateResponse, EngineError> {
        self.request(|reply| EngineCommand::Clear {
            session_id,
            origin,
            reply,
        })
        .await
    }

    pub async fn delete(&self, session_id: SessionId) -> Result<bool, EngineError> {
        self.request(|reply| EngineCommand::Delete { session_id, reply })
            .await
    }

    /// Deletes the session and hands out a fresh id.
    pub async fn reset(&self, session_id: SessionId) -> Result<SessionId, EngineError> {
        self.request(|reply| EngineCommand::Reset { session_id, reply })
            .await
    }

    pub async fn store_resource(
        &self,
        session_id: SessionId,
        upload: ResourceUpload,
    ) -> Result<ResourceRef, EngineError> {
        self.request(|reply| EngineCommand::StoreResource {
            session_id,
            upload,
            reply,
        })
        .await
    }

    pub async fn list_resources(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<ResourceRef>, EngineError> {
        self.request(|reply| EngineCommand::ListResources { session_id, reply })
            .await
    }

    pub async fn load_resource(
        &self,
        session_id: SessionId,
        resource_id: String,
    ) -> Result<Option<(ResourceRef, Vec<u8>)>, EngineError> {
        self.request(|reply| EngineCommand::LoadResource {
            session_id,
            resource_id,
            reply,
        })
        .await
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum EngineCommand {
    Load {
        session_id: SessionId,
        reply: Reply<LoadOutcome>,
    },
    Save {
        session_id: SessionId,
        document: String,
        base_version: Option<u64>,
        origin: Option<ConnectionId>,
        reply: Reply<SaveStateResponse>,
    },
    Clear {
        session_id: SessionId,
        origin: Option<ConnectionId>,
        reply: Reply<SaveStateResponse>,
    },
    Delete {
        session_id: SessionId,
        reply: Reply<bool>,
    },
    Reset {
        session_id: SessionId,
        reply: Reply<SessionId>,
    },
    StoreResource {
        session_id: SessionId,
        upload: ResourceUpload,
        reply: Reply<ResourceRef>,
    },
    ListResources {
        session_id: SessionId,
        reply: Reply<Vec<ResourceRef>>,
    },
    LoadResource {
        session_id: SessionId,
        resource_id: String,
        reply: Reply<Option<(ResourceRef, Vec<u8>)>>,
    },
}

/// Single writer for every session. Commands are handled one at a time, so a read
/// issued after a write always observes it.
pub struct Engine {
    repository: SessionRepository,
    events: broadcast::Sender<SessionEvent>,
    saves: u64,
}

impl Engine {
    pub fn start(repository: SessionRepository) -> (EngineHandle, broadcast::Sender<SessionEvent>) {
        let (tx, mut rx) = mpsc::channel::<EngineCommand>(256);
        let (events, _) = broadcast::channel::<SessionEvent>(256);

        let mut engine = Self {
            repository,
            events: events.clone(),
            saves: 0,
        };

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                engine.handle(cmd).await;
            }
        });

        let handle = EngineHandle {
            tx,
            ops: IdempotencyStore::new(IDEMPOTENCY_TTL, IDEMPOTENCY_MAX_ENTRIES),
        };
        (handle, events)
    }

    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(&SessionRepository) -> T + Send + 'static,
    ) -> Result<T, EngineError> {
        let repository = self.repository.clone();
        tokio::task::spawn_blocking(move || f(&repository))
            .await
            .map_err(|err| EngineError::Store(format!("store task failed: {err}")))
    }

    async fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Load { session_id, reply } => {
                let outcome = self.blocking(move |repo| repo.load_outcome(&session_id)).await;
                let _ = reply.send(outcome);
            }
            EngineCommand::Save {
                session_id,
                document,
                base_version,
                origin,
                reply,
            } => {
                let result = match parse_app_state(&document) {
                    Ok(state) => self.persist(session_id, state, base_version, origin).await,
                    Err(err) => {
                        tracing::debug!(session_id = %session_id, error = %err, "rejected invalid state");
                        Err(EngineError::Invalid(err.to_string()))
                    }
                };
                let _ = reply.send(result);
            }
            EngineCommand::Clear {
                session_id,
                origin,
                reply,
            } => {
                let state = AppState::default_session(&now_rfc3339());
                let result = self.persist(session_id, state, None, origin).await;
                let _ = reply.send(result);
            }
            EngineCommand::Delete { session_id, reply } => {
                let result = self
                    .blocking(move |repo| repo.delete(&session_id))
                    .await
                    .and_then(|r| r.map_err(EngineError::Store));
                let _ = reply.send(result);
            }
            EngineCommand::Reset { session_id, reply } => {
                let result = self
                    .blocking(move |repo| repo.reset(&session_id))
                    .await
                    .and_then(|r| r.map_err(EngineError::Store));
                let _ = reply.send(result);
            }
            EngineCommand::StoreResource {
                session_id,
                upload,
                reply,
            } => {
                let result = self
                    .blocking(move |repo| repo.store_resource(&session_id, upload))
                    .await
                    .and_then(|r| r.map_err(EngineError::Store));
                let _ = reply.send(result);
            }
            EngineCommand::ListResources { session_id, reply } => {
                let result = self
                    .blocking(move |repo| repo.list_resources(&session_id))
                    .await
                    .and_then(|r| r.map_err(EngineError::Store));
                let _ = reply.send(result);
            }
            EngineCommand::LoadResource {
                session_id,
                resource_id,
                reply,
            } => {
                let result = self
                    .blocking(move |repo| repo.load_resource(&session_id, &resource_id))
                    .await
                    .and_then(|r| r.map_err(EngineError::Store));
                let _ = reply.send(result);
            }
        }
    }

    async fn persist(
        &mut self,
        session_id: SessionId,
        state: AppState,
        base_version: Option<u64>,
        origin: Option<ConnectionId>,
    ) -> Result<SaveStateResponse, EngineError> {
        let sid = session_id.clone();
        let ack: SaveAck = self
            .blocking(move |repo| repo.save(&sid, state, base_version))
            .await?
            .map_err(EngineError::from)?;

        self.saves += 1;
        tracing::info!(
            session_id = %session_id,
            version = ack.version,
            saves = self.saves,
            "state saved"
        );

        let response = SaveStateResponse {
            ok: true,
            session_id: session_id.clone(),
            version: ack.version,
            updated_at: ack.updated_at.clone(),
        };
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent {
            session_id,
            state: ack.state,
            origin,
        });
        Ok(response)
    }
}
