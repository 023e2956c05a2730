//! Tracked tasks that can be aborted once shutdown stops waiting for them

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct TaskGroup {
    tracker: TaskTracker,
    handles: Arc<Mutex<Vec<AbortHandle>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.tracker.spawn(task);
        let mut handles = self.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
    }

    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait until closed and every task has finished or been aborted.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Abort every task still running. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let mut handles = self.lock();
        let mut aborted = 0;
        for handle in handles.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_all_ends_stuck_tasks() {
        let tasks = TaskGroup::new();
        tasks.spawn(async {});
        tasks.spawn(std::future::pending::<()>());
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tasks.close();

        assert!(tokio::time::timeout(Duration::from_millis(50), tasks.wait())
            .await
            .is_err());
        assert_eq!(tasks.abort_all(), 2);
        tokio::time::timeout(Duration::from_secs(1), tasks.wait())
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert_eq!(tasks.abort_all(), 0);
    }
}
