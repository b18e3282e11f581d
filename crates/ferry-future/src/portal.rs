//! Worker-side scheduling primitives.
//!
//! - [`TaskGroup`]: structured set of tasks spawned on the worker's `LocalSet`
//! - [`CancelScope`]: cancellation token for one task of a group
//! - [`Portal`]: thread-safe entry point used to start tasks from other threads
//!
//! All tasks, including the ones submitted through a portal, run inside the
//! worker's `LocalSet`, so they may in turn schedule same-thread work.

use std::future::Future;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;

use crate::error::RunnerError;

// ============================================================================
// Task Group
// ============================================================================

/// Tasks spawned on the worker thread, cancellable and awaitable as a whole.
#[derive(Clone, Default)]
pub struct TaskGroup {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the current `LocalSet`.
    ///
    /// # Panics
    ///
    /// Panics when called outside the worker's `LocalSet`.
    pub fn start_soon<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.tracker.spawn_local(task)
    }

    /// New cancel scope that is also cancelled when the group is.
    pub fn scope(&self) -> CancelScope {
        CancelScope(self.token.child_token())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting the group as open and wait for every task to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }
}

// ============================================================================
// Cancel Scope
// ============================================================================

/// Cancellation scope of a single same-thread task.
#[derive(Debug, Clone)]
pub struct CancelScope(CancellationToken);

impl CancelScope {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Future resolving once the scope is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.0.clone().cancelled_owned()
    }
}

// ============================================================================
// Portal
// ============================================================================

struct PortalRequest {
    job: BoxFuture<'static, ()>,
    token: CancellationToken,
}

/// Thread-safe handle for starting tasks on the worker from any thread.
///
/// Requests are forwarded to a listener task running inside the worker's
/// `LocalSet`, which spawns them into the owning [`TaskGroup`].
#[derive(Clone)]
pub struct Portal {
    sender: mpsc::UnboundedSender<PortalRequest>,
    closed: CancellationToken,
}

impl Portal {
    /// Open a portal whose tasks join `group`.
    ///
    /// # Panics
    ///
    /// Panics when called outside the worker's `LocalSet`.
    pub fn open(group: &TaskGroup) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        tokio::task::spawn_local(listen(receiver, group.clone(), closed.clone()));
        Self { sender, closed }
    }

    /// Start `task` on the worker without waiting for it.
    pub fn start_task_soon<F>(&self, task: F) -> Result<PortalTask, RunnerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.is_cancelled() {
            return Err(RunnerError::portal_closed("portal no longer accepts tasks"));
        }
        let token = CancellationToken::new();
        let request = PortalRequest {
            job: Box::pin(task),
            token: token.clone(),
        };
        self.sender
            .send(request)
            .map_err(|_| RunnerError::portal_closed("portal listener has stopped"))?;
        Ok(PortalTask { token })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }
}

async fn listen(
    mut receiver: mpsc::UnboundedReceiver<PortalRequest>,
    group: TaskGroup,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            request = receiver.recv() => match request {
                Some(PortalRequest { job, token }) => {
                    group.start_soon(async move {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {}
                            _ = job => {}
                        }
                    });
                }
                None => break,
            },
        }
    }
    // Queued requests are dropped with the receiver.
    tracing::debug!("portal listener stopped");
}

/// Handle to a task started through a [`Portal`].
#[derive(Debug, Clone)]
pub struct PortalTask {
    token: CancellationToken,
}

impl PortalTask {
    /// Cancel the task from any thread. The task future is dropped at its next
    /// suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_portal_runs_task_in_group() {
        LocalSet::new()
            .run_until(async {
                let group = TaskGroup::new();
                let portal = Portal::open(&group);
                let (tx, rx) = tokio::sync::oneshot::channel();
                portal
                    .start_task_soon(async move {
                        let _ = tx.send(42);
                    })
                    .unwrap();
                assert_eq!(rx.await.unwrap(), 42);
                portal.close();
                group.wait().await;
                assert!(group.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_portal_from_other_thread() {
        LocalSet::new()
            .run_until(async {
                let group = TaskGroup::new();
                let portal = Portal::open(&group);
                let (tx, rx) = tokio::sync::oneshot::channel();
                let remote = portal.clone();
                std::thread::spawn(move || {
                    remote
                        .start_task_soon(async move {
                            let _ = tx.send(std::thread::current().id());
                        })
                        .unwrap();
                })
                .join()
                .unwrap();
                assert_eq!(rx.await.unwrap(), std::thread::current().id());
                portal.close();
            })
            .await;
    }

    #[tokio::test]
    async fn test_cancelled_portal_task_is_dropped() {
        LocalSet::new()
            .run_until(async {
                let group = TaskGroup::new();
                let portal = Portal::open(&group);
                let finished = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&finished);
                let task = portal
                    .start_task_soon(async move {
                        std::future::pending::<()>().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                tokio::task::yield_now().await;
                task.cancel();
                assert!(task.is_cancelled());
                portal.close();
                group.wait().await;
                assert_eq!(finished.load(Ordering::SeqCst), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_closed_portal_rejects() {
        LocalSet::new()
            .run_until(async {
                let group = TaskGroup::new();
                let portal = Portal::open(&group);
                portal.close();
                assert!(portal.is_closed());
                let err = portal.start_task_soon(async {}).unwrap_err();
                assert!(matches!(err, RunnerError::PortalClosed { .. }));
            })
            .await;
    }

    #[tokio::test]
    async fn test_group_cancel_reaches_scopes() {
        let group = TaskGroup::new();
        let scope = group.scope();
        assert!(!scope.is_cancelled());
        group.cancel();
        assert!(scope.is_cancelled());
        scope.cancelled().await;
    }
}
