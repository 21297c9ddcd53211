//! Per-run container bookkeeping
//!
//! Holds the images confirmed pulled during this run and the containers currently running,
//! along with the per-image locks that keep pulls of the same image from overlapping.

use crate::errors::{InfinityError, Result};
use crate::keyed_mutex::{KeyedMutex, KeyedMutexGuard};
use crate::output::StageLogger;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// A container started by the driver and not yet removed
#[derive(Debug, Clone)]
pub struct RunningContainer {
    /// Engine-assigned container id
    pub id: String,
    /// Stage that started the container
    pub stage_name: String,
    /// Logger of that stage, reused when the container is torn down
    pub logger: StageLogger,
}

#[derive(Debug, Default)]
pub struct ContainerStore {
    image_locks: KeyedMutex,
    pulled_images: Mutex<HashSet<String>>,
    running: Mutex<BTreeMap<String, RunningContainer>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize work on `image` until the guard is dropped
    ///
    /// Waiting for another holder ends with [`InfinityError::Canceled`] once `cancel` fires.
    pub async fn lock_image(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyedMutexGuard<'_>> {
        self.image_locks
            .lock(image, cancel)
            .await
            .ok_or(InfinityError::Canceled)
    }

    pub fn is_pulled(&self, image: &str) -> bool {
        self.pulled_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(image)
    }

    pub fn mark_pulled(&self, image: &str) {
        self.pulled_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image.to_string());
    }

    /// Record a started container
    pub fn track(&self, container: RunningContainer) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container.id.clone(), container);
    }

    /// Forget a removed container
    pub fn untrack(&self, id: &str) -> Option<RunningContainer> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Snapshot of the containers still running, ordered by id
    pub fn running(&self) -> Vec<RunningContainer> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
