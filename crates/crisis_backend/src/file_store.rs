use crate::resources::{is_valid_resource_id, resource_ref, validate_upload};
use anyhow::Context as _;
use crisis_domain::paths;
use crisis_domain::{ResourceRef, ResourceUpload, SessionId, SessionStore, StoredState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RESOURCE_INDEX_FILE: &str = "index.json";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    updated_at_unix_ms: u64,
    state: serde_json::Value,
}

/// One JSON file per session under `<root>/sessions`, uploads under `<root>/resources`.
pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write of resource indexes.
    index_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(root: PathBuf) -> anyhow::Result<Self> {
        for dir in [paths::sessions_root(&root), paths::resources_root(&root)] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    fn read_index(&self, session_id: &SessionId) -> anyhow::Result<Vec<ResourceRef>> {
        let path = paths::session_resources_dir(&self.root, session_id).join(RESOURCE_INDEX_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        serde_json::from_str(&text).with_context(|| format!("corrupt index {}", path.display()))
    }

    fn write_index(&self, session_id: &SessionId, index: &[ResourceRef]) -> anyhow::Result<()> {
        let path = paths::session_resources_dir(&self.root, session_id).join(RESOURCE_INDEX_FILE);
        let bytes = serde_json::to_vec_pretty(index).context("failed to encode resource index")?;
        write_atomic(&path, &bytes)
    }

    fn store_resource_inner(
        &self,
        session_id: &SessionId,
        upload: ResourceUpload,
    ) -> anyhow::Result<ResourceRef> {
        validate_upload(&upload).map_err(anyhow::Error::msg)?;
        let resource = resource_ref(session_id, &upload);
        let dir = paths::session_resources_dir(&self.root, session_id);
        write_atomic(&dir.join(&resource.id), &upload.bytes)?;

        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut index = self.read_index(session_id)?;
        index.retain(|existing| existing.id != resource.id);
        index.push(resource.clone());
        self.write_index(session_id, &index)?;
        Ok(resource)
    }
}

/// Writes through a sibling temp file and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| {
        let _ = std::fs::remove_file(&tmp);
        format!("failed to move {} into place", path.display())
    })?;
    Ok(())
}

impl SessionStore for FileStore {
    fn load_state(&self, session_id: &SessionId) -> Result<Option<StoredState>, String> {
        let path = paths::session_state_path(&self.root, session_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        match serde_json::from_str::<StateFile>(&text) {
            Ok(file) => Ok(Some(StoredState {
                json: file.state.to_string(),
                updated_at_unix_ms: file.updated_at_unix_ms,
            })),
            // Not our envelope: hand the raw text up so validation can reject it.
            Err(_) => Ok(Some(StoredState {
                json: text,
                updated_at_unix_ms: 0,
            })),
        }
    }

    fn save_state(&self, session_id: &SessionId, state: StoredState) -> Result<(), String> {
        let value: serde_json::Value = serde_json::from_str(&state.json)
            .map_err(|err| format!("refusing to store invalid JSON: {err}"))?;
        let file = StateFile {
            updated_at_unix_ms: state.updated_at_unix_ms,
            state: value,
        };
        let bytes = serde_json::to_vec(&file).map_err(|err| err.to_string())?;
        write_atomic(&paths::session_state_path(&self.root, session_id), &bytes)
            .map_err(|err| format!("{err:#}"))
    }

    fn delete_state(&self, session_id: &SessionId) -> Result<bool, String> {
        let path = paths::session_state_path(&self.root, session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(format!("failed to delete {}: {err}", path.display())),
        }
    }

    fn store_resource(
        &self,
        session_id: &SessionId,
        upload: ResourceUpload,
    ) -> Result<ResourceRef, String> {
        self.store_resource_inner(session_id, upload)
            .map_err(|err| format!("{err:#}"))
    }

    fn list_resources(&self, session_id: &SessionId) -> Result<Vec<ResourceRef>, String> {
        self.read_index(session_id).map_err(|err| format!("{err:#}"))
    }

    fn load_resource(
        &self,
        session_id: &SessionId,
        resource_id: &str,
    ) -> Result<Option<(ResourceRef, Vec<u8>)>, String> {
        if !is_valid_resource_id(resource_id) {
            return Ok(None);
        }
        let index = self.read_index(session_id).map_err(|err| format!("{err:#}"))?;
        let Some(resource) = index.into_iter().find(|r| r.id == resource_id) else {
            return Ok(None);
        };
        let path = paths::session_resources_dir(&self.root, session_id).join(resource_id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some((resource, bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format!("failed to read {}: {err}", path.display())),
        }
    }

    fn delete_resources(&self, session_id: &SessionId) -> Result<usize, String> {
        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = self
            .read_index(session_id)
            .map(|index| index.len())
            .unwrap_or(0);
        let dir = paths::session_resources_dir(&self.root, session_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(count),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(format!("failed to delete {}: {err}", dir.display())),
        }
    }
}
