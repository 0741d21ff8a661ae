//! Durable local storage backed by sled
//!
//! One database holds three trees:
//! - `local`: survives restarts (refresh token)
//! - `session`: per-session scratch space (live reload bookkeeping)
//! - `deferred_calls`: the offline request queue

use crate::error::Result;
use std::path::Path;
use tracing::info;

pub(crate) const LOCAL_TREE: &str = "local";
pub(crate) const SESSION_TREE: &str = "session";
pub(crate) const DEFERRED_CALLS_TREE: &str = "deferred_calls";

/// Handle to the client database
#[derive(Clone)]
pub struct ClientStorage {
    db: sled::Db,
}

impl ClientStorage {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!(path = %path.display(), "Opened client storage");
        Ok(Self { db })
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Key-value store that survives restarts
    pub fn local(&self) -> Result<KeyValueStore> {
        Ok(KeyValueStore {
            tree: self.db.open_tree(LOCAL_TREE)?,
        })
    }

    /// Key-value store for the current session
    pub fn session(&self) -> Result<KeyValueStore> {
        Ok(KeyValueStore {
            tree: self.db.open_tree(SESSION_TREE)?,
        })
    }

    pub(crate) fn tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Monotonic id, unique for the lifetime of the database
    pub fn generate_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ClientStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStorage")
            .field("was_recovered", &self.db.was_recovered())
            .finish()
    }
}

/// String key-value tree
#[derive(Clone)]
pub struct KeyValueStore {
    tree: sled::Tree,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .tree
            .get(key)?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key, value.as_bytes())?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }
}
