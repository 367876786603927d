use crisis_domain::time::{now_unix_ms, rfc3339_from_unix_ms};
use crisis_domain::{
    AppState, LoadOutcome, LoadSource, ResourceRef, ResourceUpload, SessionId, SessionStore,
    StateError, StoredState, parse_app_state, resolve_loaded,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("version conflict: expected {expected}, stored {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error(transparent)]
    Invalid(#[from] StateError),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SaveAck {
    pub version: u64,
    pub updated_at: String,
    pub state: AppState,
}

/// Session-level operations over any [`SessionStore`]: masked loads, stamped full-blob
/// saves, and resets that retire a session id.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn SessionStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Non-masking read: `Ok(None)` when no record exists.
    pub fn fetch(&self, session_id: &SessionId) -> Result<Option<AppState>, SaveError> {
        let Some(stored) = self
            .store
            .load_state(session_id)
            .map_err(SaveError::Store)?
        else {
            return Ok(None);
        };
        Ok(Some(parse_app_state(&stored.json)?))
    }

    /// Never fails. Missing records and fetch errors yield the default session; an
    /// invalid stored document is replaced by the default and re-saved immediately.
    pub fn load(&self, session_id: &SessionId) -> AppState {
        self.load_outcome(session_id).state
    }

    /// [`Self::load`] plus the reason the returned state was chosen.
    pub fn load_outcome(&self, session_id: &SessionId) -> LoadOutcome {
        let now = rfc3339_from_unix_ms(now_unix_ms());
        let fetched = self
            .store
            .load_state(session_id)
            .map(|stored| stored.map(|s| s.json));
        let mut outcome = resolve_loaded(fetched, &now);

        match &outcome.source {
            LoadSource::Stored => {}
            LoadSource::Missing => {
                tracing::debug!(session_id = %session_id, "no stored state, using default");
            }
            LoadSource::FetchFailed(message) => {
                tracing::warn!(session_id = %session_id, error = %message, "failed to load state, using default");
            }
            LoadSource::Invalid(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "stored state is invalid, replacing with default");
            }
        }

        if outcome.needs_resave() {
            match self.save(session_id, outcome.state.clone(), None) {
                Ok(ack) => outcome.state = ack.state,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to re-save default state");
                }
            }
        }
        outcome
    }

    /// Upserts the full document, stamping `meta.updatedAt` and `meta.version` (one past the
    /// stored version, or past the submitted one when nothing valid is stored). With
    /// `expected_version` set, the write is refused unless it matches the stored version.
    pub fn save(
        &self,
        session_id: &SessionId,
        mut state: AppState,
        expected_version: Option<u64>,
    ) -> Result<SaveAck, SaveError> {
        let stored_version = self
            .store
            .load_state(session_id)
            .map_err(SaveError::Store)?
            .and_then(|stored| parse_app_state(&stored.json).ok())
            .map(|existing| existing.meta.version);

        if let Some(expected) = expected_version
            && expected != stored_version.unwrap_or(0)
        {
            return Err(SaveError::Conflict {
                expected,
                actual: stored_version.unwrap_or(0),
            });
        }

        let now_ms = now_unix_ms();
        state.meta.version = stored_version.unwrap_or(state.meta.version) + 1;
        state.meta.updated_at = rfc3339_from_unix_ms(now_ms);

        let stored = StoredState {
            json: state.to_json(),
            updated_at_unix_ms: now_ms,
        };
        if let Err(message) = self.store.save_state(session_id, stored) {
            tracing::warn!(session_id = %session_id, error = %message, "failed to save state");
            return Err(SaveError::Store(message));
        }

        Ok(SaveAck {
            version: state.meta.version,
            updated_at: state.meta.updated_at.clone(),
            state,
        })
    }

    /// Removes the state record and every uploaded resource of the session.
    pub fn delete(&self, session_id: &SessionId) -> Result<bool, String> {
        let removed_resources = self.store.delete_resources(session_id)?;
        let existed = self.store.delete_state(session_id)?;
        tracing::info!(
            session_id = %session_id,
            existed,
            removed_resources,
            "deleted session"
        );
        Ok(existed)
    }

    /// Deletes everything stored under `session_id` and returns a fresh id.
    pub fn reset(&self, session_id: &SessionId) -> Result<SessionId, String> {
        self.delete(session_id)?;
        let next = SessionId::generate();
        tracing::info!(old = %session_id, new = %next, "session reset");
        Ok(next)
    }

    pub fn store_resource(
        &self,
        session_id: &SessionId,
        upload: ResourceUpload,
    ) -> Result<ResourceRef, String> {
        self.store.store_resource(session_id, upload)
    }

    pub fn list_resources(&self, session_id: &SessionId) -> Result<Vec<ResourceRef>, String> {
        self.store.list_resources(session_id)
    }

    pub fn load_resource(
        &self,
        session_id: &SessionId,
        resource_id: &str,
    ) -> Result<Option<(ResourceRef, Vec<u8>)>, String> {
        self.store.load_resource(session_id, resource_id)
    }
}
