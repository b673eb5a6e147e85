//! # keeper-db
//!
//! Local key-value persistence for the Keeper node.
//!
//! Keys use the same structured `<mainID>/<typeTag>/<option>...` scheme as
//! network requests, which makes prefix iteration the natural way to restore
//! one kind of state. Two backends implement [`KvStore`]:
//!
//! - [`sqlite::SqliteStore`]: a single SQLite file in WAL mode.
//! - [`memory::MemoryStore`]: an ordered in-memory map for tests.

pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Local key-value persistence used for crash recovery.
pub trait KvStore: Send + Sync {
    /// Insert or overwrite a key.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read a key, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let entries = self.iterate(prefix)?;
        for (key, _) in &entries {
            self.delete(key)?;
        }
        Ok(entries.len())
    }
}
