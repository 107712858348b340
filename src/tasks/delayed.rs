//! Delayed Task
//!
//! A one-shot action that runs after a delay unless cancelled first.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Cancellable delayed action.
///
/// Dropping the task cancels it. An action that needs to release its own
/// `DelayedTask` while running must call [`DelayedTask::detach`] instead,
/// otherwise it aborts itself at its next await point.
#[derive(Debug)]
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    // == Schedule ==
    /// Spawns `action` to run after `delay`. Must be called within a tokio
    /// runtime.
    pub fn schedule<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stops the action if it has not completed yet.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Releases the task without cancelling it.
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
