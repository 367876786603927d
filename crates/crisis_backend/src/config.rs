use crate::env::{optional_trimmed_from_env, optional_trimmed_path_from_env};
use crate::{FileStore, MemoryStore, SqliteStore};
use anyhow::anyhow;
use crisis_domain::SessionStore;
use crisis_domain::paths::{self, CRISIS_DATA_DIR_ENV, CRISIS_STORE_ENV};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_DATA_DIR: &str = "crisis-data";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StoreKind {
    #[default]
    File,
    Sqlite,
    Memory,
}

impl StoreKind {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "file" | "fs" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(anyhow!(
                "{CRISIS_STORE_ENV} must be one of file, sqlite, memory (got {other:?})"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let kind = match optional_trimmed_from_env(CRISIS_STORE_ENV)? {
            Some(raw) => StoreKind::parse(&raw)?,
            None => StoreKind::default(),
        };
        let data_dir = optional_trimmed_path_from_env(CRISIS_DATA_DIR_ENV)?
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        Ok(Self { kind, data_dir })
    }

    pub fn memory() -> Self {
        Self {
            kind: StoreKind::Memory,
            ..Self::default()
        }
    }
}

pub fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    tracing::info!(
        kind = config.kind.as_str(),
        data_dir = %config.data_dir.display(),
        "opening session store"
    );
    let store: Arc<dyn SessionStore> = match config.kind {
        StoreKind::File => Arc::new(FileStore::open(config.data_dir.clone())?),
        StoreKind::Sqlite => Arc::new(SqliteStore::new(paths::sqlite_path(&config.data_dir))?),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
