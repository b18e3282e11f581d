//! Awaitable side of a pending operation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::OperationError;
use crate::pending::{Completion, PendingOperation};
use crate::runner::{CancelHandle, Runner};

enum FutureState<T> {
    Init {
        runner: Runner,
        operation: PendingOperation<T>,
    },
    Running {
        completion: Completion<T>,
        cancel_handle: Option<CancelHandle>,
        cancellation_required: bool,
    },
    Done,
}

/// Future over an operation driven by a [`Runner`].
///
/// The operation is scheduled on the first poll. Awaiting it from any
/// executor yields the value the worker produced.
pub struct BridgeFuture<T> {
    state: FutureState<T>,
}

impl<T: Send + 'static> BridgeFuture<T> {
    pub fn new(runner: Runner, operation: PendingOperation<T>) -> Self {
        Self {
            state: FutureState::Init { runner, operation },
        }
    }

    /// Request cancellation. Returns `false` if the operation already settled
    /// or cancellation was already requested.
    pub fn cancel(&mut self) -> bool {
        match std::mem::replace(&mut self.state, FutureState::Done) {
            FutureState::Init { operation, .. } => {
                let completion = operation.completion();
                drop(operation);
                completion.set_exception(OperationError::Cancelled);
                self.state = FutureState::Running {
                    completion,
                    cancel_handle: None,
                    cancellation_required: true,
                };
                true
            }
            FutureState::Running {
                completion,
                mut cancel_handle,
                cancellation_required,
            } => {
                let requested = !cancellation_required && !completion.is_settled();
                if requested {
                    if let Some(handle) = cancel_handle.as_mut() {
                        handle.cancel();
                    }
                }
                self.state = FutureState::Running {
                    completion,
                    cancel_handle,
                    cancellation_required: cancellation_required || requested,
                };
                requested
            }
            FutureState::Done => false,
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self.state, FutureState::Init { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, FutureState::Running { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, FutureState::Done)
    }
}

impl<T: Send + 'static> Future for BridgeFuture<T> {
    type Output = Result<T, OperationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, FutureState::Done) {
                FutureState::Init { runner, operation } => {
                    let completion = operation.completion();
                    match runner.schedule(operation) {
                        Ok(handle) => {
                            this.state = FutureState::Running {
                                completion,
                                cancel_handle: Some(handle),
                                cancellation_required: false,
                            };
                        }
                        Err(err) => return Poll::Ready(Err(err.into())),
                    }
                }
                FutureState::Running {
                    completion,
                    cancel_handle,
                    cancellation_required,
                } => {
                    return match completion.poll_outcome(cx) {
                        Poll::Ready(outcome) => Poll::Ready(outcome),
                        Poll::Pending => {
                            this.state = FutureState::Running {
                                completion,
                                cancel_handle,
                                cancellation_required,
                            };
                            Poll::Pending
                        }
                    };
                }
                FutureState::Done => panic!("BridgeFuture polled after completion"),
            }
        }
    }
}

impl<T> Drop for BridgeFuture<T> {
    fn drop(&mut self) {
        if let FutureState::Running {
            completion,
            cancellation_required: false,
            ..
        } = &self.state
        {
            if !completion.is_settled() {
                tracing::warn!(
                    "BridgeFuture dropped while running without cancellation, \
                     the operation keeps running detached"
                );
            }
        }
    }
}

/// Cancels the wrapped future's operation when dropped before it settled.
pub struct CancelOnDrop<T: Send + 'static>(pub BridgeFuture<T>);

impl<T: Send + 'static> Future for CancelOnDrop<T> {
    type Output = Result<T, OperationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T: Send + 'static> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Worker, WorkerConfig};
    use std::time::Duration;

    #[test]
    fn test_future_resolves_across_threads() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let mut future = worker.runner().future(async { 21 * 2 });
        assert!(future.is_init());

        let value = futures::executor::block_on(&mut future).unwrap();
        assert_eq!(value, 42);
        assert!(future.is_done());
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_try_future_surfaces_error() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let future = worker
            .runner()
            .try_future(async { Err::<(), _>(anyhow::anyhow!("no such file")) });

        let err = futures::executor::block_on(future).unwrap_err();
        assert_eq!(err.to_string(), "no such file");
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_cancel_before_first_poll() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let mut future = worker.runner().future(async { 1 });
        assert!(future.cancel());
        assert!(!future.cancel());

        let outcome = futures::executor::block_on(future);
        assert!(matches!(outcome, Err(OperationError::Cancelled)));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_cancel_on_drop() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (dropped_tx, dropped_rx) = std::sync::mpsc::channel::<()>();

        struct Notify(std::sync::mpsc::Sender<()>);
        impl Drop for Notify {
            fn drop(&mut self) {
                let _ = self.0.send(());
            }
        }

        let mut future = CancelOnDrop(worker.runner().future(async move {
            let _notify = Notify(dropped_tx);
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(future);
        dropped_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_closed_runner_fails_future() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        worker.runner().close();
        let outcome = futures::executor::block_on(worker.runner().future(async {}));
        assert!(matches!(outcome, Err(OperationError::Runner(_))));
        worker.shutdown().unwrap();
    }
}
