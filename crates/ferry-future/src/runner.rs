//! The runner: schedules pending operations on the worker runtime.
//!
//! Scheduling depends on the calling thread:
//!
//! ```text
//! caller on worker thread   → TaskGroup::start_soon  (cancel via CancelScope)
//! caller on any other thread → Portal::start_task_soon (cancel via PortalTask)
//! ```
//!
//! Either way the task settles the operation's completion exactly once:
//! a value, the handler's error, a captured panic, or `Cancelled`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::future::BridgeFuture;
use crate::pending::{drive, PendingOperation, SettleGuard};
use crate::portal::{CancelScope, Portal, PortalTask, TaskGroup};
use crate::stack::Close;

static RUNNER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct RunnerShared {
    id: u64,
    worker: ThreadId,
    group: TaskGroup,
    portal: Portal,
    closed: CancellationToken,
}

impl Close for RunnerShared {
    fn close(&self) -> anyhow::Result<()> {
        if !self.closed.is_cancelled() {
            tracing::debug!(runner = self.id, "closing runner");
            self.closed.cancel();
        }
        Ok(())
    }
}

/// Handle for scheduling work on one worker session.
///
/// Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<RunnerShared>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.shared.id)
            .field("worker", &self.shared.worker)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Runner {
    pub(crate) fn new(worker: ThreadId, group: TaskGroup, portal: Portal) -> Self {
        Self {
            shared: Arc::new(RunnerShared {
                id: RUNNER_ID.fetch_add(1, Ordering::Relaxed),
                worker,
                group,
                portal,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<RunnerShared> {
        &self.shared
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the caller runs on the worker thread that owns this runner.
    pub fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.shared.worker
    }

    /// Schedule `operation` on the worker and return a handle that can cancel it.
    ///
    /// Same-thread callers must be running inside the worker's `LocalSet`.
    pub fn schedule<T>(&self, operation: PendingOperation<T>) -> Result<CancelHandle, RunnerError>
    where
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(RunnerError::runner_closed(format!(
                "runner {} no longer accepts operations",
                self.shared.id
            )));
        }

        let (awaitable, completion) = operation.into_parts();
        let guard = SettleGuard::new(completion);

        let path = if self.on_worker_thread() {
            let scope = self.shared.group.scope();
            let cancelled = scope.cancelled();
            self.shared.group.start_soon(async move {
                drive(awaitable, guard, cancelled).await;
            });
            tracing::trace!(runner = self.shared.id, "scheduled operation on worker thread");
            SchedulingPath::SameThread {
                scope,
                worker: self.shared.worker,
                portal: self.shared.portal.clone(),
            }
        } else {
            let teardown = self.shared.group.token().clone().cancelled_owned();
            let task = self.shared.portal.start_task_soon(async move {
                drive(awaitable, guard, teardown).await;
            })?;
            tracing::trace!(runner = self.shared.id, "scheduled operation through portal");
            SchedulingPath::CrossThread { task }
        };

        Ok(CancelHandle { path })
    }

    /// Future resolving to `awaitable`'s output, driven on the worker.
    pub fn future<T, F>(&self, awaitable: F) -> BridgeFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.try_future(async move { Ok(awaitable.await) })
    }

    /// Like [`future`](Self::future) for fallible awaitables.
    pub fn try_future<T, F>(&self, awaitable: F) -> BridgeFuture<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        BridgeFuture::new(self.clone(), PendingOperation::new(awaitable))
    }

    /// Stop accepting new operations. Idempotent.
    pub fn close(&self) {
        // Closing a runner cannot fail.
        let _ = Close::close(self.shared.as_ref());
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn closed_notificator(&self) -> ClosedNotificator {
        ClosedNotificator {
            closed: self.shared.closed.clone(),
        }
    }
}

// ============================================================================
// Cancel Handle
// ============================================================================

/// How an operation was scheduled, chosen once per [`Runner::schedule`].
enum SchedulingPath {
    SameThread {
        scope: CancelScope,
        worker: ThreadId,
        portal: Portal,
    },
    CrossThread {
        task: PortalTask,
    },
}

/// Requests cancellation of one scheduled operation.
pub struct CancelHandle {
    path: SchedulingPath,
}

impl CancelHandle {
    /// Request cancellation without blocking. Cancelling a finished or
    /// already-cancelled operation has no effect.
    pub fn cancel(&mut self) {
        match &self.path {
            SchedulingPath::SameThread {
                scope,
                worker,
                portal,
            } => {
                if thread::current().id() == *worker {
                    scope.cancel();
                } else {
                    let remote = scope.clone();
                    if portal
                        .start_task_soon(async move { remote.cancel() })
                        .is_err()
                    {
                        // Worker is tearing down; the token itself is thread-safe.
                        scope.cancel();
                    }
                }
            }
            SchedulingPath::CrossThread { task } => task.cancel(),
        }
    }

    pub fn is_same_thread(&self) -> bool {
        matches!(self.path, SchedulingPath::SameThread { .. })
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("same_thread", &self.is_same_thread())
            .finish()
    }
}

// ============================================================================
// Closed Notificator
// ============================================================================

/// Observes when a runner gets closed.
#[derive(Debug, Clone)]
pub struct ClosedNotificator {
    closed: CancellationToken,
}

impl ClosedNotificator {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn wait(&self) {
        self.closed.cancelled().await;
    }

    /// Block the current thread until the runner is closed.
    ///
    /// Must not be called on the worker thread.
    pub fn blocking_wait(&self) {
        futures::executor::block_on(self.closed.cancelled());
    }
}
