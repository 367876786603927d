mod config;
mod env;
mod file_store;
mod memory_store;
mod repository;
mod resources;
mod sqlite_store;

pub use config::{StoreConfig, StoreKind, open_store};
pub use env::optional_trimmed_path_from_env;
pub use file_store::{FileStore, write_atomic};
pub use memory_store::MemoryStore;
pub use repository::{SaveAck, SaveError, SessionRepository};
pub use sqlite_store::SqliteStore;
