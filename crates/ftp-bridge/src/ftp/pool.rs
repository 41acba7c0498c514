//! Transfer pool — bounded workers for upload copy tasks.
//!
//! At most `max` copies run at once and at most `max` more wait for a
//! worker. Anything beyond that is rejected immediately; the pool never
//! queues past its bound. One pool is shared by every session on a
//! connector.

use crate::ftp::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

pub struct TransferPool {
    /// Running plus waiting tasks.
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    max: usize,
    tracker: TaskTracker,
}

impl TransferPool {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            admission: Arc::new(Semaphore::new(max * 2)),
            workers: Arc::new(Semaphore::new(max)),
            max,
            tracker: TaskTracker::new(),
        }
    }

    /// Copies currently holding a worker.
    pub fn active(&self) -> usize {
        self.max - self.workers.available_permits()
    }

    /// Admitted tasks, running or waiting.
    pub fn admitted(&self) -> usize {
        (self.max * 2).saturating_sub(self.admission.available_permits())
    }

    pub fn is_shut_down(&self) -> bool {
        self.admission.is_closed()
    }

    /// Admit `task` or reject it with a capacity error.
    pub fn submit<F, T>(&self, task: F) -> BridgeResult<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let admitted = self.admission.clone().try_acquire_owned().map_err(|e| match e {
            TryAcquireError::NoPermits => BridgeError::capacity(format!(
                "Transfer pool saturated ({} running, {} waiting)",
                self.max, self.max
            )),
            TryAcquireError::Closed => BridgeError::capacity("Transfer pool is shut down"),
        })?;
        let workers = Arc::clone(&self.workers);
        Ok(self.tracker.spawn(async move {
            let _admitted = admitted;
            // The worker semaphore is never closed, so the permit is
            // always granted eventually.
            let _worker = workers.acquire_owned().await.ok();
            task.await
        }))
    }

    /// Stop admitting work and wait up to `grace` for admitted tasks.
    /// Returns whether everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.admission.close();
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if finished {
            tracing::info!("Transfer pool drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Transfer pool shutdown grace period elapsed"
            );
        }
        finished
    }
}

impl std::fmt::Debug for TransferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPool")
            .field("max", &self.max)
            .field("active", &self.active())
            .field("admitted", &self.admitted())
            .finish()
    }
}
