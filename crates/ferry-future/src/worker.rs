//! Dedicated worker thread hosting one runner session.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tokio::task::LocalSet;

use crate::builder::RunnerBuilder;
use crate::error::{panic_message, WorkerError};
use crate::runner::Runner;

/// Worker thread configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// OS thread name (default: "ferry-worker")
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "ferry-worker".to_string(),
        }
    }
}

/// A running worker thread with a current-thread tokio runtime and `LocalSet`.
///
/// The worker keeps its session open until [`shutdown`](Self::shutdown) is
/// called or the handle is dropped.
pub struct Worker {
    runner: Runner,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Worker {
    /// Start the worker thread and wait until its runner is ready.
    pub fn spawn(config: WorkerConfig) -> Result<Self, WorkerError> {
        let (init_tx, init_rx) = mpsc::channel::<Result<Runner, WorkerError>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || -> anyhow::Result<()> {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = init_tx.send(Err(WorkerError::spawn(e.to_string())));
                        return Err(e.into());
                    }
                };

                let local = LocalSet::new();
                let session = local.block_on(&rt, async move {
                    let mut builder = match RunnerBuilder::enter() {
                        Ok(builder) => builder,
                        Err(e) => {
                            let _ = init_tx.send(Err(WorkerError::spawn(e.to_string())));
                            return Err(e.into());
                        }
                    };
                    let runner = builder.build();
                    if init_tx.send(Ok(runner)).is_ok() {
                        // A dropped sender also ends the session.
                        let _ = shutdown_rx.await;
                    }
                    builder.shutdown(None).await
                });
                session
            })
            .map_err(|e| WorkerError::spawn(e.to_string()))?;

        let runner = match init_rx.recv() {
            Ok(Ok(runner)) => runner,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                return Err(match thread.join() {
                    Err(payload) => WorkerError::panicked(panic_message(payload.as_ref())),
                    Ok(_) => WorkerError::spawn("worker exited before its runner was ready"),
                });
            }
        };

        tracing::info!(
            thread = %config.thread_name,
            runner = runner.id(),
            "Worker started"
        );

        Ok(Self {
            runner,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Close the session, wait for the thread and report teardown errors.
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), WorkerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(Ok(())) => {
                tracing::info!(runner = self.runner.id(), "Worker stopped");
                Ok(())
            }
            Ok(Err(err)) => Err(WorkerError::teardown(err)),
            Err(payload) => Err(WorkerError::panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "Worker shutdown failed");
        }
    }
}
