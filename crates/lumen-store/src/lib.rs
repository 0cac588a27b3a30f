pub mod error;
pub mod kv;
pub mod settings;
pub mod sqlite;

pub use error::{Result, StoreError};
pub use kv::{KeyValueStore, MemoryStore};
pub use settings::{keys, SettingsService};
pub use sqlite::SqliteStore;
