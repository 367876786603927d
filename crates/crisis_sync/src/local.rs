use anyhow::Context as _;
use crisis_backend::{SaveError, SessionRepository};
use crisis_domain::paths::LOCAL_SESSION_KEY;
use crisis_domain::time::{now_rfc3339, now_unix_ms};
use crisis_domain::{
    Action, AppState, SessionId, SessionStore, export_file_name, export_json, import_json,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Single-writer session kept under a fixed key, without any remote or merging.
pub struct LocalSession {
    repository: SessionRepository,
    key: SessionId,
    state: AppState,
    dirty: bool,
}

impl LocalSession {
    /// Loads the stored document, falling back to a default session.
    pub fn open(store: Arc<dyn SessionStore>) -> anyhow::Result<Self> {
        let key = SessionId::parse(LOCAL_SESSION_KEY)
            .with_context(|| format!("invalid local session key {LOCAL_SESSION_KEY:?}"))?;
        let repository = SessionRepository::new(store);
        let state = repository.load(&key);
        Ok(Self {
            repository,
            key,
            state,
            dirty: false,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn dispatch(&mut self, action: Action) -> bool {
        let changed = !self.state.apply(action).is_empty();
        self.dirty |= changed;
        changed
    }

    pub fn save(&mut self) -> Result<(), SaveError> {
        let ack = self.repository.save(&self.key, self.state.clone(), None)?;
        self.state.meta.version = ack.version;
        self.state.meta.updated_at = ack.updated_at;
        self.dirty = false;
        Ok(())
    }

    /// Saves only when something changed since the last save.
    pub fn save_if_dirty(&mut self) -> Result<bool, SaveError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Writes a pretty-printed copy into `dir` and returns its path.
    pub fn export_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(export_file_name(now_unix_ms()));
        std::fs::write(&path, export_json(&self.state))
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "exported session");
        Ok(path)
    }

    /// Replaces the session with an exported file and saves it. An invalid file leaves
    /// the current document as it was.
    pub fn import_from(&mut self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        import_json(&mut self.state, &text)
            .with_context(|| format!("{} is not a session export", path.display()))?;
        self.dirty = true;
        self.save().context("failed to save imported session")?;
        tracing::info!(path = %path.display(), "imported session");
        Ok(())
    }

    /// Drops the stored document and starts over from the default session.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.repository
            .delete(&self.key)
            .map_err(anyhow::Error::msg)
            .context("failed to delete local session")?;
        self.state = AppState::default_session(&now_rfc3339());
        self.dirty = false;
        Ok(())
    }
}

/// Saves `session` every `every` while it has unsaved changes.
pub fn spawn_autosave(
    session: Arc<Mutex<LocalSession>>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let session = session.clone();
            let result = tokio::task::spawn_blocking(move || {
                session
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .save_if_dirty()
            })
            .await;
            match result {
                Ok(Ok(true)) => tracing::debug!("autosaved local session"),
                Ok(Ok(false)) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "autosave failed"),
                Err(err) => {
                    tracing::warn!(error = %err, "autosave task failed");
                    break;
                }
            }
        }
    })
}
