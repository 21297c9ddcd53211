//! Structured concurrency for parallel stage groups
//!
//! Every task of a group shares one cancellation token derived from the parent scope. The
//! first task to fail with a real error cancels that token so its siblings wind down, and
//! [`TaskGroup::join`] waits for all of them before reporting the first error.

use crate::errors::{InfinityError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug)]
pub struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
    limit: Option<Arc<Semaphore>>,
}

impl TaskGroup {
    /// Create a group whose token is a child of `parent`
    ///
    /// `max_parallel` bounds how many tasks run at once; `None` or zero means unbounded.
    pub fn new(parent: &CancellationToken, max_parallel: Option<usize>) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: parent.child_token(),
            limit: max_parallel
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a task built from the group token
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let limit = self.limit.clone();
        let fut = task(cancel.clone());

        self.tasks.spawn(async move {
            let _permit = match limit {
                Some(semaphore) => tokio::select! {
                    permit = semaphore.acquire_owned() => Some(permit.map_err(|e| {
                        InfinityError::Internal(format!("parallelism limit closed: {}", e))
                    })?),
                    _ = cancel.cancelled() => return Err(InfinityError::Canceled),
                },
                None => None,
            };

            let result = fut.await;
            if let Err(err) = &result {
                if !err.is_canceled() {
                    debug!("Task failed, canceling siblings: {}", err);
                    cancel.cancel();
                }
            }
            result
        });
    }

    /// Wait for every task and return the first real error
    ///
    /// Returns [`InfinityError::Canceled`] when tasks were only canceled.
    pub async fn join(mut self) -> Result<()> {
        let mut first_error: Option<InfinityError> = None;
        let mut canceled = false;

        while let Some(joined) = self.tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) if err.is_canceled() => {
                    canceled = true;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join_err) => {
                    error!("Stage task panicked: {}", join_err);
                    self.cancel.cancel();
                    InfinityError::Internal(format!("stage task panicked: {}", join_err))
                }
            };

            if first_error.is_none() {
                first_error = Some(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if canceled => Err(InfinityError::Canceled),
            None => Ok(()),
        }
    }
}
