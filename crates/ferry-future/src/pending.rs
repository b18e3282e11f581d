//! Pending operations and their write-once completion slot.
//!
//! A [`PendingOperation`] pairs an awaitable with a [`Completion`]. The
//! awaitable is driven on the worker runtime; whoever holds a clone of the
//! completion (usually a [`BridgeFuture`](crate::BridgeFuture) on the native
//! side) observes the outcome exactly once.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{panic_message, OperationError};

// ============================================================================
// Completion
// ============================================================================

enum Slot<T> {
    Pending,
    Settled(Result<T, OperationError>),
    /// Outcome already handed to the awaiting side
    Consumed,
}

struct State<T> {
    slot: Slot<T>,
    waker: Option<Waker>,
}

/// Shared result/exception slot of one pending operation.
///
/// At most one of [`set_result`](Self::set_result) and
/// [`set_exception`](Self::set_exception) takes effect. The first call
/// settles the slot and wakes the awaiting task.
pub struct Completion<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slot: Slot::Pending,
                waker: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle with a value. Returns `false` if the slot was already settled.
    pub fn set_result(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an exception. Returns `false` if the slot was already settled.
    pub fn set_exception(&self, error: OperationError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, OperationError>) -> bool {
        if self.settle_if_pending(outcome) {
            return true;
        }
        tracing::error!("pending operation settled twice, keeping the first outcome");
        debug_assert!(false, "pending operation settled twice");
        false
    }

    /// Settle only if nothing settled the slot yet. Never reports a conflict.
    pub(crate) fn settle_if_pending(&self, outcome: Result<T, OperationError>) -> bool {
        let waker = {
            let mut state = self.lock();
            if !matches!(state.slot, Slot::Pending) {
                return false;
            }
            state.slot = Slot::Settled(outcome);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.lock().slot, Slot::Pending)
    }

    /// Take the outcome if the slot is settled and the outcome was not taken yet.
    pub fn try_take(&self) -> Option<Result<T, OperationError>> {
        let mut state = self.lock();
        match std::mem::replace(&mut state.slot, Slot::Consumed) {
            Slot::Settled(outcome) => Some(outcome),
            other => {
                state.slot = other;
                None
            }
        }
    }

    /// Poll for the outcome, registering `cx`'s waker while still pending.
    ///
    /// Polling again after the outcome was taken is a caller bug: it is
    /// logged and answered with an error instead of a second outcome.
    pub fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<T, OperationError>> {
        let mut state = self.lock();
        match std::mem::replace(&mut state.slot, Slot::Consumed) {
            Slot::Settled(outcome) => Poll::Ready(outcome),
            Slot::Pending => {
                state.slot = Slot::Pending;
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Slot::Consumed => {
                drop(state);
                tracing::error!("completion polled after its outcome was taken");
                debug_assert!(false, "completion polled after its outcome was already taken");
                Poll::Ready(Err(OperationError::Failed(anyhow::anyhow!(
                    "outcome of this operation was already taken"
                ))))
            }
        }
    }
}

// ============================================================================
// Pending Operation
// ============================================================================

/// An awaitable together with the completion it must settle.
pub struct PendingOperation<T> {
    awaitable: BoxFuture<'static, anyhow::Result<T>>,
    completion: Completion<T>,
}

impl<T> PendingOperation<T> {
    pub fn new<F>(awaitable: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::with_completion(awaitable, Completion::new())
    }

    /// Build an operation that settles an existing completion.
    pub fn with_completion<F>(awaitable: F, completion: Completion<T>) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            awaitable: Box::pin(awaitable),
            completion,
        }
    }

    pub fn completion(&self) -> Completion<T> {
        self.completion.clone()
    }

    pub(crate) fn into_parts(self) -> (BoxFuture<'static, anyhow::Result<T>>, Completion<T>) {
        (self.awaitable, self.completion)
    }
}

// ============================================================================
// Driving
// ============================================================================

/// How a scheduled task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskExit {
    Settled,
    Cancelled,
}

/// Settles the completion as cancelled if the task is dropped before it settled.
pub(crate) struct SettleGuard<T> {
    completion: Completion<T>,
}

impl<T> SettleGuard<T> {
    pub(crate) fn new(completion: Completion<T>) -> Self {
        Self { completion }
    }

    /// Check how the task ended while the slot is still untouched by the guard.
    ///
    /// A task that exits normally must have settled its operation. If it did
    /// not, the native side would wait forever: report it and answer with
    /// `Cancelled` so the waiter is released.
    pub(crate) fn finish(self, exit: TaskExit) -> bool {
        if exit == TaskExit::Settled && !self.completion.is_settled() {
            tracing::error!("task finished without settling its pending operation");
            self.completion
                .settle_if_pending(Err(OperationError::Cancelled));
            debug_assert!(false, "task finished without settling its pending operation");
            return false;
        }
        true
    }
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        if self.completion.settle_if_pending(Err(OperationError::Cancelled)) {
            tracing::debug!("scheduled operation dropped before settling, marked cancelled");
        }
    }
}

/// Drive `awaitable` to completion unless `cancelled` resolves first, then
/// settle the guarded completion exactly once.
///
/// Handler errors and panics end up in the completion and never escape the task.
pub(crate) async fn drive<T, C>(
    awaitable: BoxFuture<'static, anyhow::Result<T>>,
    guard: SettleGuard<T>,
    cancelled: C,
) -> TaskExit
where
    C: Future<Output = ()>,
{
    let completion = guard.completion.clone();
    let exit = tokio::select! {
        biased;
        _ = cancelled => {
            completion.set_exception(OperationError::Cancelled);
            TaskExit::Cancelled
        }
        outcome = AssertUnwindSafe(awaitable).catch_unwind() => {
            match outcome {
                Ok(Ok(value)) => completion.set_result(value),
                Ok(Err(err)) => completion.set_exception(OperationError::Failed(err)),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(panic = %message, "scheduled operation panicked");
                    completion.set_exception(OperationError::Panicked(message))
                }
            };
            TaskExit::Settled
        }
    };
    guard.finish(exit);
    exit
}
