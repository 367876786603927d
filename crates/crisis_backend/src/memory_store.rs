use crate::resources::{resource_ref, validate_upload};
use crisis_domain::{ResourceRef, ResourceUpload, SessionId, SessionStore, StoredState};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    states: HashMap<SessionId, StoredState>,
    resources: HashMap<SessionId, Vec<(ResourceRef, Vec<u8>)>>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemoryStore {
    fn load_state(&self, session_id: &SessionId) -> Result<Option<StoredState>, String> {
        Ok(self.lock().states.get(session_id).cloned())
    }

    fn save_state(&self, session_id: &SessionId, state: StoredState) -> Result<(), String> {
        self.lock().states.insert(session_id.clone(), state);
        Ok(())
    }

    fn delete_state(&self, session_id: &SessionId) -> Result<bool, String> {
        Ok(self.lock().states.remove(session_id).is_some())
    }

    fn store_resource(
        &self,
        session_id: &SessionId,
        upload: ResourceUpload,
    ) -> Result<ResourceRef, String> {
        validate_upload(&upload)?;
        let resource = resource_ref(session_id, &upload);
        let mut inner = self.lock();
        let entries = inner.resources.entry(session_id.clone()).or_default();
        entries.retain(|(existing, _)| existing.id != resource.id);
        entries.push((resource.clone(), upload.bytes));
        Ok(resource)
    }

    fn list_resources(&self, session_id: &SessionId) -> Result<Vec<ResourceRef>, String> {
        Ok(self
            .lock()
            .resources
            .get(session_id)
            .map(|entries| entries.iter().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default())
    }

    fn load_resource(
        &self,
        session_id: &SessionId,
        resource_id: &str,
    ) -> Result<Option<(ResourceRef, Vec<u8>)>, String> {
        Ok(self.lock().resources.get(session_id).and_then(|entries| {
            entries
                .iter()
                .find(|(r, _)| r.id == resource_id)
                .cloned()
        }))
    }

    fn delete_resources(&self, session_id: &SessionId) -> Result<usize, String> {
        Ok(self
            .lock()
            .resources
            .remove(session_id)
            .map(|entries| entries.len())
            .unwrap_or(0))
    }
}
