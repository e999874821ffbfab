//! Trial stores for Parallax.
//!
//! Provides a SQLite-backed store that several worker processes can share,
//! an in-memory store for single-process use, and [`open_store`] to pick one
//! from a storage url.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use px_types::{StoreError, StoreResult, TrialStore};
use tracing::info;

/// Url scheme for a SQLite file: `sqlite:///relative.db` or `sqlite:////abs/path.db`.
pub const SQLITE_SCHEME: &str = "sqlite:///";

/// Url of the process-local store.
pub const MEMORY_URL: &str = "memory://";

/// True when the url names a store that other processes can see.
pub fn is_persistent(url: &str) -> bool {
    url.starts_with(SQLITE_SCHEME)
}

/// Open the store named by `url`.
pub fn open_store(url: &str, busy_timeout: Duration) -> StoreResult<Arc<dyn TrialStore>> {
    if let Some(path) = url.strip_prefix(SQLITE_SCHEME) {
        if path.is_empty() {
            return Err(StoreError::UnsupportedUrl {
                url: url.to_string(),
            });
        }
        info!(path, "opening sqlite trial store");
        return Ok(Arc::new(SqliteStore::open(path, busy_timeout)?));
    }
    if url == MEMORY_URL {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    Err(StoreError::UnsupportedUrl {
        url: url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use px_types::StudyDirection;

    #[test]
    fn opens_sqlite_and_memory_urls() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("{SQLITE_SCHEME}{}", dir.path().join("s.db").display());
        let store = open_store(&url, Duration::from_secs(5)).unwrap();
        store
            .create_or_load_study("demo", StudyDirection::Maximize, "random")
            .unwrap();
        assert!(is_persistent(&url));

        let memory = open_store(MEMORY_URL, Duration::from_secs(5)).unwrap();
        assert!(memory.study_names().unwrap().is_empty());
        assert!(!is_persistent(MEMORY_URL));
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            open_store("postgres://localhost/db", Duration::from_secs(1)),
            Err(StoreError::UnsupportedUrl { .. })
        ));
        assert!(matches!(
            open_store(SQLITE_SCHEME, Duration::from_secs(1)),
            Err(StoreError::UnsupportedUrl { .. })
        ));
    }
}
