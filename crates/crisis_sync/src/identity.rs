use anyhow::Context as _;
use crisis_domain::SessionId;
use std::path::Path;

/// The session id a client works under, kept in a small file next to its offline queue.
pub struct SessionIdentity;

impl SessionIdentity {
    /// Reads the stored id, or generates and stores a new one when the file is missing or
    /// holds something that is not a valid id.
    pub fn load_or_create(path: &Path) -> anyhow::Result<SessionId> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                if let Some(id) = SessionId::parse(&text) {
                    return Ok(id);
                }
                tracing::warn!(path = %path.display(), "stored session id is invalid, generating a new one");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        }
        let id = SessionId::generate();
        Self::store(path, &id)?;
        tracing::info!(session_id = %id, "created session identity");
        Ok(id)
    }

    pub fn store(path: &Path, id: &SessionId) -> anyhow::Result<()> {
        crisis_backend::write_atomic(path, id.as_str().as_bytes())
    }

    /// Replaces the stored id with a fresh one.
    pub fn rotate(path: &Path) -> anyhow::Result<SessionId> {
        let id = SessionId::generate();
        Self::store(path, &id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crisis_domain::paths::session_identity_path;

    #[test]
    fn identity_is_stable_until_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = session_identity_path(dir.path());

        let first = SessionIdentity::load_or_create(&path).unwrap();
        assert_eq!(SessionIdentity::load_or_create(&path).unwrap(), first);

        let rotated = SessionIdentity::rotate(&path).unwrap();
        assert_ne!(rotated, first);
        assert_eq!(SessionIdentity::load_or_create(&path).unwrap(), rotated);
    }

    #[test]
    fn garbage_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = session_identity_path(dir.path());
        std::fs::write(&path, "../../etc").unwrap();

        let id = SessionIdentity::load_or_create(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), id.as_str());
    }
}
