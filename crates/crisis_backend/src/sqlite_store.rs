use crate::resources::{is_valid_resource_id, resource_ref, validate_upload};
use anyhow::{Context as _, anyhow};
use crisis_domain::{ResourceRef, ResourceUpload, SessionId, SessionStore, StoredState};
use rusqlite::{Connection, OptionalExtension as _, params};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/migrations/0001_init.sql"
        )),
    ),
    (
        2,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/migrations/0002_resources.sql"
        )),
    ),
];

/// Embedded key-value backend. All statements run on one worker thread that owns
/// the connection; callers block on a reply channel.
#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<DbCommand>,
}

enum DbCommand {
    LoadState {
        session_id: SessionId,
        reply: mpsc::Sender<anyhow::Result<Option<StoredState>>>,
    },
    SaveState {
        session_id: SessionId,
        state: StoredState,
        reply: mpsc::Sender<anyhow::Result<()>>,
    },
    DeleteState {
        session_id: SessionId,
        reply: mpsc::Sender<anyhow::Result<bool>>,
    },
    InsertResource {
        resource: ResourceRef,
        bytes: Vec<u8>,
        reply: mpsc::Sender<anyhow::Result<()>>,
    },
    ListResources {
        session_id: SessionId,
        reply: mpsc::Sender<anyhow::Result<Vec<ResourceRef>>>,
    },
    LoadResource {
        session_id: SessionId,
        resource_id: String,
        reply: mpsc::Sender<anyhow::Result<Option<(ResourceRef, Vec<u8>)>>>,
    },
    DeleteResources {
        session_id: SessionId,
        reply: mpsc::Sender<anyhow::Result<usize>>,
    },
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<DbCommand>();

        std::thread::Builder::new()
            .name("crisis-sqlite".to_owned())
            .spawn(move || {
                let mut db = SqliteDatabase::open(&db_path);
                if let Err(err) = &db {
                    tracing::error!(path = %db_path.display(), error = %format!("{err:#}"), "failed to open sqlite store");
                }
                while let Ok(cmd) = rx.recv() {
                    match (&mut db, cmd) {
                        (Ok(db), DbCommand::LoadState { session_id, reply }) => {
                            let _ = reply.send(db.load_state(&session_id));
                        }
                        (
                            Ok(db),
                            DbCommand::SaveState {
                                session_id,
                                state,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.save_state(&session_id, &state));
                        }
                        (Ok(db), DbCommand::DeleteState { session_id, reply }) => {
                            let _ = reply.send(db.delete_state(&session_id));
                        }
                        (
                            Ok(db),
                            DbCommand::InsertResource {
                                resource,
                                bytes,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.insert_resource(&resource, &bytes));
                        }
                        (Ok(db), DbCommand::ListResources { session_id, reply }) => {
                            let _ = reply.send(db.list_resources(&session_id));
                        }
                        (
                            Ok(db),
                            DbCommand::LoadResource {
                                session_id,
                                resource_id,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.load_resource(&session_id, &resource_id));
                        }
                        (Ok(db), DbCommand::DeleteResources { session_id, reply }) => {
                            let _ = reply.send(db.delete_resources(&session_id));
                        }
                        (Err(err), cmd) => {
                            respond_db_open_error(err, cmd);
                        }
                    }
                }
            })
            .context("failed to spawn sqlite worker thread")?;

        Ok(Self { tx })
    }

    fn request<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<anyhow::Result<T>>) -> DbCommand,
    ) -> Result<T, String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| "sqlite worker is not running".to_owned())?;
        reply_rx
            .recv()
            .map_err(|_| "sqlite worker terminated".to_owned())?
            .map_err(|err| format!("{err:#}"))
    }
}

fn respond_db_open_error(err: &anyhow::Error, cmd: DbCommand) {
    let message = format!("{err:#}");
    match cmd {
        DbCommand::LoadState { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::SaveState { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::DeleteState { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::InsertResource { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::ListResources { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::LoadResource { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::DeleteResources { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
    }
}

impl SessionStore for SqliteStore {
    fn load_state(&self, session_id: &SessionId) -> Result<Option<StoredState>, String> {
        self.request(|reply| DbCommand::LoadState {
            session_id: session_id.clone(),
            reply,
        })
    }

    fn save_state(&self, session_id: &SessionId, state: StoredState) -> Result<(), String> {
        self.request(|reply| DbCommand::SaveState {
            session_id: session_id.clone(),
            state,
            reply,
        })
    }

    fn delete_state(&self, session_id: &SessionId) -> Result<bool, String> {
        self.request(|reply| DbCommand::DeleteState {
            session_id: session_id.clone(),
            reply,
        })
    }

    fn store_resource(
        &self,
        session_id: &SessionId,
        upload: ResourceUpload,
    ) -> Result<ResourceRef, String> {
        validate_upload(&upload)?;
        let resource = resource_ref(session_id, &upload);
        let stored = resource.clone();
        self.request(|reply| DbCommand::InsertResource {
            resource: stored,
            bytes: upload.bytes,
            reply,
        })?;
        Ok(resource)
    }

    fn list_resources(&self, session_id: &SessionId) -> Result<Vec<ResourceRef>, String> {
        self.request(|reply| DbCommand::ListResources {
            session_id: session_id.clone(),
            reply,
        })
    }

    fn load_resource(
        &self,
        session_id: &SessionId,
        resource_id: &str,
    ) -> Result<Option<(ResourceRef, Vec<u8>)>, String> {
        if !is_valid_resource_id(resource_id) {
            return Ok(None);
        }
        self.request(|reply| DbCommand::LoadResource {
            session_id: session_id.clone(),
            resource_id: resource_id.to_owned(),
            reply,
        })
    }

    fn delete_resources(&self, session_id: &SessionId) -> Result<usize, String> {
        self.request(|reply| DbCommand::DeleteResources {
            session_id: session_id.clone(),
            reply,
        })
    }
}

struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite db {}", db_path.display()))?;

        configure_connection(&mut conn).context("failed to configure sqlite connection")?;
        apply_migrations(&mut conn).context("failed to apply sqlite migrations")?;

        Ok(Self { conn })
    }

    fn load_state(&mut self, session_id: &SessionId) -> anyhow::Result<Option<StoredState>> {
        self.conn
            .query_row(
                "SELECT state_json, updated_at_unix_ms FROM app_state WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| {
                    Ok(StoredState {
                        json: row.get::<_, String>(0)?,
                        updated_at_unix_ms: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
            .context("failed to load session state")
    }

    fn save_state(&mut self, session_id: &SessionId, state: &StoredState) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_state (session_id, state_json, updated_at_unix_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                   state_json = excluded.state_json,
                   updated_at_unix_ms = excluded.updated_at_unix_ms",
                params![
                    session_id.as_str(),
                    state.json,
                    state.updated_at_unix_ms as i64
                ],
            )
            .context("failed to upsert session state")?;
        Ok(())
    }

    fn delete_state(&mut self, session_id: &SessionId) -> anyhow::Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM app_state WHERE session_id = ?1",
                params![session_id.as_str()],
            )
            .context("failed to delete session state")?;
        Ok(removed > 0)
    }

    fn insert_resource(&mut self, resource: &ResourceRef, bytes: &[u8]) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO resources (session_id, resource_id, name, mime, bytes, created_at_unix_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id, resource_id) DO UPDATE SET
                   name = excluded.name,
                   mime = excluded.mime,
                   created_at_unix_ms = excluded.created_at_unix_ms",
                params![
                    resource.session_id.as_str(),
                    resource.id,
                    resource.name,
                    resource.mime,
                    bytes,
                    resource.created_at_unix_ms as i64
                ],
            )
            .context("failed to insert resource")?;
        Ok(())
    }

    fn list_resources(&mut self, session_id: &SessionId) -> anyhow::Result<Vec<ResourceRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT resource_id, name, mime, length(bytes), created_at_unix_ms
             FROM resources
             WHERE session_id = ?1
             ORDER BY created_at_unix_ms ASC, resource_id ASC",
        )?;
        let rows = stmt.query_map(params![session_id.as_str()], |row| {
            Ok(ResourceRef {
                id: row.get(0)?,
                session_id: session_id.clone(),
                name: row.get(1)?,
                mime: row.get(2)?,
                byte_len: row.get::<_, i64>(3)? as u64,
                created_at_unix_ms: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn load_resource(
        &mut self,
        session_id: &SessionId,
        resource_id: &str,
    ) -> anyhow::Result<Option<(ResourceRef, Vec<u8>)>> {
        self.conn
            .query_row(
                "SELECT name, mime, bytes, created_at_unix_ms
                 FROM resources
                 WHERE session_id = ?1 AND resource_id = ?2",
                params![session_id.as_str(), resource_id],
                |row| {
                    let bytes: Vec<u8> = row.get(2)?;
                    Ok((
                        ResourceRef {
                            id: resource_id.to_owned(),
                            session_id: session_id.clone(),
                            name: row.get(0)?,
                            mime: row.get(1)?,
                            byte_len: bytes.len() as u64,
                            created_at_unix_ms: row.get::<_, i64>(3)? as u64,
                        },
                        bytes,
                    ))
                },
            )
            .optional()
            .context("failed to load resource")
    }

    fn delete_resources(&mut self, session_id: &SessionId) -> anyhow::Result<usize> {
        self.conn
            .execute(
                "DELETE FROM resources WHERE session_id = ?1",
                params![session_id.as_str()],
            )
            .context("failed to delete resources")
    }
}

fn configure_connection(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to apply sqlite PRAGMAs")?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    let mut current: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .context("failed to read user_version")? as u32;

    if current > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "sqlite schema version is newer than this build: db={}, app={}",
            current,
            LATEST_SCHEMA_VERSION
        ));
    }

    if current == LATEST_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to begin migration transaction")?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply migration v{version:04}"))?;
        tx.pragma_update(None, "user_version", *version as i64)
            .context("failed to update user_version")?;
        current = *version;
    }
    tx.commit()
        .context("failed to commit migration transaction")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn migrations_create_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::open(&dir.path().join("crisis.db")).unwrap();

        let count: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('app_state','resources')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let version: i64 = db
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, LATEST_SCHEMA_VERSION as i64);
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crisis.db");
        drop(SqliteDatabase::open(&path).unwrap());
        let mut db = SqliteDatabase::open(&path).unwrap();
        assert_eq!(db.load_state(&sid("s-none")).unwrap(), None);
    }

    #[test]
    fn store_upserts_and_deletes_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("crisis.db")).unwrap();
        let id = sid("s-sql");

        for (json, at) in [("{\"v\":1}", 1), ("{\"v\":2}", 2)] {
            store
                .save_state(
                    &id,
                    StoredState {
                        json: json.to_owned(),
                        updated_at_unix_ms: at,
                    },
                )
                .unwrap();
        }
        let loaded = store.load_state(&id).unwrap().unwrap();
        assert_eq!(loaded.json, "{\"v\":2}");
        assert_eq!(loaded.updated_at_unix_ms, 2);

        assert!(store.delete_state(&id).unwrap());
        assert_eq!(store.load_state(&id).unwrap(), None);
    }

    #[test]
    fn resources_are_scoped_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("crisis.db")).unwrap();
        let a = sid("s-a");
        let b = sid("s-b");
        let upload = ResourceUpload {
            name: "roster.csv".to_owned(),
            mime: "text/csv".to_owned(),
            bytes: b"name,phone\n".to_vec(),
            created_at_unix_ms: 10,
        };

        let stored = store.store_resource(&a, upload.clone()).unwrap();
        store.store_resource(&b, upload).unwrap();

        let (resource, bytes) = store.load_resource(&a, &stored.id).unwrap().unwrap();
        assert_eq!(resource.byte_len, 11);
        assert_eq!(bytes, b"name,phone\n");

        assert_eq!(store.delete_resources(&a).unwrap(), 1);
        assert!(store.list_resources(&a).unwrap().is_empty());
        assert_eq!(store.list_resources(&b).unwrap().len(), 1);
    }

    #[test]
    fn unopenable_path_reports_errors_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let store = SqliteStore::new(blocker.join("nested").join("crisis.db")).unwrap();
        let err = store.load_state(&sid("s-x")).unwrap_err();
        assert!(err.contains("failed to create"), "unexpected error: {err}");
    }
}
