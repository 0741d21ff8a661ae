//! Durable queue of deferred endpoint calls
//!
//! Entries live in the `deferred_calls` sled tree keyed by big-endian ids,
//! so iteration order is insertion order. The `submitting` flag marks an
//! entry claimed by a drain; claims go through `compare_and_swap`, so two
//! concurrent drains can never submit the same entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::Tree;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{ClientStorage, DEFERRED_CALLS_TREE};

/// A stored endpoint call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredCall {
    pub id: u64,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub submitting: bool,
}

/// Durable FIFO of deferred calls
#[derive(Clone)]
pub struct RequestQueue {
    storage: ClientStorage,
    tree: Tree,
}

impl RequestQueue {
    /// Open the queue, releasing claims left behind by an interrupted drain
    pub fn open(storage: &ClientStorage) -> Result<Self> {
        let queue = Self {
            storage: storage.clone(),
            tree: storage.tree(DEFERRED_CALLS_TREE)?,
        };
        let released = queue.release_stale_claims()?;
        if released > 0 {
            info!(count = released, "Released stale deferred call claims");
        }
        Ok(queue)
    }

    /// Store a call and flush it to disk
    pub async fn push(&self, endpoint: &str, method: &str, params: Option<Value>) -> Result<DeferredCall> {
        let call = DeferredCall {
            id: self.storage.generate_id()?,
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            params,
            submitting: false,
        };
        self.tree.insert(call.id.to_be_bytes(), serde_json::to_vec(&call)?)?;
        self.tree.flush_async().await?;
        debug!(id = call.id, endpoint = %call.endpoint, method = %call.method, "Deferred call stored");
        Ok(call)
    }

    pub fn get(&self, id: u64) -> Result<Option<DeferredCall>> {
        self.tree
            .get(id.to_be_bytes())?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
            .transpose()
    }

    /// All entries in insertion order. Undecodable entries are skipped.
    pub fn list(&self) -> Result<Vec<DeferredCall>> {
        let mut calls = Vec::new();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<DeferredCall>(&value) {
                Ok(call) => calls.push(call),
                Err(e) => warn!(key = ?key, error = %e, "Skipping undecodable deferred call"),
            }
        }
        Ok(calls)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Mark an entry as submitting.
    ///
    /// Returns `None` when the entry is gone or already claimed.
    pub fn claim(&self, id: u64) -> Result<Option<DeferredCall>> {
        let key = id.to_be_bytes();
        loop {
            let Some(current) = self.tree.get(key)? else {
                return Ok(None);
            };
            let mut call: DeferredCall = serde_json::from_slice(&current)?;
            if call.submitting {
                return Ok(None);
            }
            call.submitting = true;
            let claimed = serde_json::to_vec(&call)?;
            if self
                .tree
                .compare_and_swap(key, Some(current), Some(claimed))?
                .is_ok()
            {
                return Ok(Some(call));
            }
        }
    }

    /// Clear the submitting flag so a later drain retries the entry
    pub fn release(&self, id: u64) -> Result<()> {
        self.tree.fetch_and_update(id.to_be_bytes(), |old| {
            old.map(|bytes| match serde_json::from_slice::<DeferredCall>(bytes) {
                Ok(mut call) => {
                    call.submitting = false;
                    serde_json::to_vec(&call).unwrap_or_else(|_| bytes.to_vec())
                }
                Err(_) => bytes.to_vec(),
            })
        })?;
        Ok(())
    }

    pub fn remove(&self, id: u64) -> Result<()> {
        self.tree.remove(id.to_be_bytes())?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }

    fn release_stale_claims(&self) -> Result<usize> {
        let mut released = 0;
        for call in self.list()? {
            if call.submitting {
                self.release(call.id)?;
                released += 1;
            }
        }
        Ok(released)
    }
}
