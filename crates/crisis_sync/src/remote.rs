use anyhow::Context as _;
use crisis_api::{ErrorResponse, ResetResponse, SaveStateRequest, SaveStateResponse, StateResponse};
use crisis_backend::{SaveError, SessionRepository};
use crisis_domain::{AppState, SessionId};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const APPLIED_OPS_TTL: Duration = Duration::from_secs(10 * 60);
const APPLIED_OPS_MAX_ENTRIES: usize = 1024;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("version conflict: expected {expected}, stored {actual}")]
    Conflict { expected: u64, actual: u64 },
}

impl RemoteError {
    /// Transport failures and server-side errors are worth another attempt; a rejected
    /// document is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Conflict { .. } => false,
        }
    }
}

/// The remote side of a session, as seen by the synchronizer.
pub trait RemoteStore: Send + Sync {
    /// `Ok(None)` when nothing is stored for the session.
    fn fetch<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<Option<AppState>, RemoteError>>;

    /// Full-document upsert. `client_op_id` makes a replayed write idempotent.
    fn save<'a>(
        &'a self,
        session_id: &'a SessionId,
        state: &'a AppState,
        client_op_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SaveStateResponse, RemoteError>>;

    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<(), RemoteError>>;

    /// Deletes the session and returns the id to continue under.
    fn reset<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<SessionId, RemoteError>>;
}

/// Speaks the server's JSON API.
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }
}

fn unreachable(err: reqwest::Error) -> RemoteError {
    RemoteError::Unreachable(err.to_string())
}

/// A success status with a body we cannot read will not improve on retry.
fn undecodable(status: u16) -> impl FnOnce(reqwest::Error) -> RemoteError {
    move |err| RemoteError::Rejected {
        status,
        message: format!("malformed response body: {err}"),
    }
}

async fn error_from_response(res: reqwest::Response) -> RemoteError {
    let status = res.status().as_u16();
    let message = match res.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => format!("unexpected status {status}"),
    };
    RemoteError::Rejected { status, message }
}

impl RemoteStore for HttpRemote {
    fn fetch<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<Option<AppState>, RemoteError>> {
        async move {
            let res = self
                .client
                .get(format!("{}/api/state?sessionId={session_id}", self.base_url))
                .send()
                .await
                .map_err(unreachable)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }
            let status = res.status().as_u16();
            let body: StateResponse = res.json().await.map_err(undecodable(status))?;
            Ok(body.exists.then_some(body.state))
        }
        .boxed()
    }

    fn save<'a>(
        &'a self,
        session_id: &'a SessionId,
        state: &'a AppState,
        client_op_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SaveStateResponse, RemoteError>> {
        async move {
            let body = SaveStateRequest {
                session_id: session_id.clone(),
                state: serde_json::to_value(state).map_err(|err| RemoteError::Rejected {
                    status: 400,
                    message: err.to_string(),
                })?,
                base_version: None,
                client_op_id: client_op_id.map(str::to_owned),
            };
            let res = self
                .client
                .post(format!("{}/api/state", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(unreachable)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }
            let status = res.status().as_u16();
            res.json().await.map_err(undecodable(status))
        }
        .boxed()
    }

    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<(), RemoteError>> {
        async move {
            let res = self
                .client
                .delete(format!("{}/api/state/{session_id}", self.base_url))
                .send()
                .await
                .map_err(unreachable)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }
            Ok(())
        }
        .boxed()
    }

    fn reset<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<SessionId, RemoteError>> {
        async move {
            let res = self
                .client
                .post(format!("{}/api/state/{session_id}/reset", self.base_url))
                .send()
                .await
                .map_err(unreachable)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }
            let status = res.status().as_u16();
            let body: ResetResponse = res.json().await.map_err(undecodable(status))?;
            Ok(body.session_id)
        }
        .boxed()
    }
}

/// Acknowledgements of replayed operations, kept for a while and capped in number.
struct AppliedOps {
    entries: HashMap<String, AppliedOp>,
    next_seq: u64,
    ttl: Duration,
    max_entries: usize,
}

struct AppliedOp {
    seq: u64,
    expires_at: Instant,
    ack: SaveStateResponse,
}

impl AppliedOps {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            ttl,
            max_entries,
        }
    }

    fn get(&self, key: &str) -> Option<SaveStateResponse> {
        self.entries
            .get(key)
            .filter(|op| op.expires_at > Instant::now())
            .map(|op| op.ack.clone())
    }

    fn insert(&mut self, key: String, ack: SaveStateResponse) {
        let now = Instant::now();
        self.entries.retain(|_, op| op.expires_at > now);
        self.next_seq += 1;
        self.entries.insert(
            key,
            AppliedOp {
                seq: self.next_seq,
                expires_at: now + self.ttl,
                ack,
            },
        );
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, op)| op.seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => self.entries.remove(&key),
                None => break,
            };
        }
    }
}

/// In-process remote over a [`SessionRepository`]; store calls run on the blocking pool.
#[derive(Clone)]
pub struct RepositoryRemote {
    repository: SessionRepository,
    applied_ops: Arc<Mutex<AppliedOps>>,
}

impl RepositoryRemote {
    pub fn new(repository: SessionRepository) -> Self {
        Self {
            repository,
            applied_ops: Arc::new(Mutex::new(AppliedOps::new(
                APPLIED_OPS_TTL,
                APPLIED_OPS_MAX_ENTRIES,
            ))),
        }
    }

    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(&SessionRepository) -> T + Send + 'static,
    ) -> Result<T, RemoteError> {
        let repository = self.repository.clone();
        tokio::task::spawn_blocking(move || f(&repository))
            .await
            .map_err(|err| RemoteError::Unreachable(format!("store task failed: {err}")))
    }

    fn applied_ops(&self) -> std::sync::MutexGuard<'_, AppliedOps> {
        self.applied_ops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remote_save_error(err: SaveError) -> RemoteError {
    match err {
        SaveError::Conflict { expected, actual } => RemoteError::Conflict { expected, actual },
        SaveError::Invalid(err) => RemoteError::Rejected {
            status: 400,
            message: err.to_string(),
        },
        SaveError::Store(message) => RemoteError::Unreachable(message),
    }
}

impl RemoteStore for RepositoryRemote {
    fn fetch<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<Option<AppState>, RemoteError>> {
        async move {
            let id = session_id.clone();
            self.blocking(move |repo| repo.fetch(&id))
                .await?
                .map_err(remote_save_error)
        }
        .boxed()
    }

    fn save<'a>(
        &'a self,
        session_id: &'a SessionId,
        state: &'a AppState,
        client_op_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SaveStateResponse, RemoteError>> {
        async move {
            let key = client_op_id.map(|op| format!("{session_id}/{op}"));
            if let Some(key) = &key
                && let Some(ack) = self.applied_ops().get(key)
            {
                return Ok(ack);
            }

            let id = session_id.clone();
            let state = state.clone();
            let saved = self
                .blocking(move |repo| repo.save(&id, state, None))
                .await?
                .map_err(remote_save_error)?;
            let ack = SaveStateResponse {
                ok: true,
                session_id: session_id.clone(),
                version: saved.version,
                updated_at: saved.updated_at,
            };
            if let Some(key) = key {
                self.applied_ops().insert(key, ack.clone());
            }
            Ok(ack)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<(), RemoteError>> {
        async move {
            let id = session_id.clone();
            self.blocking(move |repo| repo.delete(&id))
                .await?
                .map(|_| ())
                .map_err(RemoteError::Unreachable)
        }
        .boxed()
    }

    fn reset<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<SessionId, RemoteError>> {
        async move {
            let id = session_id.clone();
            self.blocking(move |repo| repo.reset(&id))
                .await?
                .map_err(RemoteError::Unreachable)
        }
        .boxed()
    }
}
