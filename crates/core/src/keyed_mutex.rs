//! Mutex scoped to string keys
//!
//! Holders of distinct keys never wait on each other; holders of the same key are serialized
//! in FIFO order. A key's entry is dropped from the table once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

type Slot = Arc<AsyncMutex<()>>;

/// A set of async locks addressed by key
#[derive(Debug, Default)]
pub struct KeyedMutex {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Holds the lock for one key until dropped
#[derive(Debug)]
pub struct KeyedMutexGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and acquire the lock for `key`
    ///
    /// Gives up with `None` once `cancel` fires while the key is held elsewhere.
    pub async fn lock(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Option<KeyedMutexGuard<'_>> {
        let acquired = tokio::select! {
            biased;
            guard = self.slot(key).lock_owned() => Some(guard),
            _ = cancel.cancelled() => None,
        };

        match acquired {
            Some(guard) => Some(KeyedMutexGuard {
                owner: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            None => {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                evict_idle(&mut slots, key);
                None
            }
        }
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }
}

/// Drop the entry for `key` when only the table still references it
fn evict_idle(slots: &mut HashMap<String, Slot>, key: &str) {
    if slots
        .get(key)
        .is_some_and(|slot| Arc::strong_count(slot) == 1)
    {
        slots.remove(key);
    }
}

impl KeyedMutexGuard<'_> {
    /// Key this guard holds
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedMutexGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self
            .owner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Release while the table is locked so no new waiter can clone the slot in between.
        self.guard.take();
        evict_idle(&mut slots, &self.key);
    }
}
