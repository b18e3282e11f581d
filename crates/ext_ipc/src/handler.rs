//! Native-facing entry point: turns invokes into scheduled command runs.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_future::{panic_message, CancelHandle, Completion, PendingOperation, Runner};
use futures::FutureExt;

use crate::commands::{CommandEntry, CommandError, Commands, DispatchError};
use crate::invoke::{Invoke, InvokeResolver, WebviewWindow};
use crate::IpcError;

// ============================================================================
// Capability Checker
// ============================================================================

/// Decides whether a command may be invoked from a given window.
pub trait CommandCapabilityChecker: Send + Sync {
    fn check_command(&self, command: &str, window: Option<&WebviewWindow>) -> Result<(), String>;
}

/// Default permissive checker (for dev mode)
pub struct PermissiveChecker;

impl CommandCapabilityChecker for PermissiveChecker {
    fn check_command(&self, _command: &str, _window: Option<&WebviewWindow>) -> Result<(), String> {
        Ok(())
    }
}

// ============================================================================
// Invoke Handler
// ============================================================================

struct InFlight {
    command: String,
    handle: CancelHandle,
    completion: Completion<()>,
}

/// Dispatches native invokes onto the worker.
///
/// [`handle`](Self::handle) never blocks and never fails: every invoke is
/// either rejected on the spot or scheduled, and is answered exactly once.
#[derive(Clone)]
pub struct InvokeHandler {
    commands: Arc<Commands>,
    runner: Runner,
    checker: Arc<dyn CommandCapabilityChecker>,
    in_flight: Arc<Mutex<Vec<InFlight>>>,
}

impl InvokeHandler {
    pub fn new(commands: Commands, runner: Runner) -> Self {
        Self {
            commands: Arc::new(commands),
            runner,
            checker: Arc::new(PermissiveChecker),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn CommandCapabilityChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Handle one invoke from the native side.
    pub fn handle(&self, invoke: Invoke) {
        let command = invoke.command().to_string();
        if command.is_empty() {
            invoke.reject("invoke is missing a command name");
            return;
        }

        if let Err(reason) = self.checker.check_command(&command, invoke.webview_window()) {
            tracing::debug!(command = %command, reason = %reason, "Command denied");
            invoke.reject(IpcError::permission_denied(reason).to_string());
            return;
        }

        let Some(entry) = self.commands.get(&command) else {
            tracing::debug!(command = %command, "No command handler found");
            invoke.reject(DispatchError::NotFound(command).to_string());
            return;
        };

        let Some(resolver) = invoke.bind_to(entry.parameters()) else {
            return;
        };

        let operation = PendingOperation::new(run_command(entry.clone(), resolver));
        let completion = operation.completion();
        match self.runner.schedule(operation) {
            Ok(handle) => self.track(command, handle, completion),
            // The resolver went down with the operation and rejected the invoke.
            Err(err) => tracing::warn!(command = %command, error = %err, "Failed to schedule command"),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Vec<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, command: String, handle: CancelHandle, completion: Completion<()>) {
        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|entry| !entry.completion.is_settled());
        in_flight.push(InFlight {
            command,
            handle,
            completion,
        });
    }

    /// Number of scheduled commands that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight()
            .iter()
            .filter(|entry| !entry.completion.is_settled())
            .count()
    }

    /// Request cancellation of every unfinished command. Returns how many were
    /// still running.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<InFlight> = self.lock_in_flight().drain(..).collect();
        let mut cancelled = 0;
        for mut entry in drained {
            if entry.completion.is_settled() {
                continue;
            }
            tracing::debug!(command = %entry.command, "Cancelling command");
            entry.handle.cancel();
            cancelled += 1;
        }
        cancelled
    }
}

/// Run one command and answer its invoke.
///
/// Rejections pass through verbatim; unexpected failures are logged once and
/// answered with their top-level message only.
async fn run_command(entry: CommandEntry, mut resolver: InvokeResolver) -> anyhow::Result<()> {
    let arguments = resolver.take_arguments();
    let outcome = AssertUnwindSafe(async move { entry.call(arguments).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(body)) => resolver.resolve(body),
        Ok(Err(CommandError::Reject(message))) => {
            tracing::debug!(command = %resolver.command(), message = %message, "Command rejected");
            resolver.reject(message);
        }
        Ok(Err(CommandError::Failed(err))) => {
            tracing::error!(command = %resolver.command(), error = ?err, "Command failed");
            resolver.reject(err.to_string());
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(command = %resolver.command(), panic = %message, "Command panicked");
            let reply = format!("command `{}` failed unexpectedly", resolver.command());
            resolver.reject(reply);
        }
    }
    Ok(())
}
