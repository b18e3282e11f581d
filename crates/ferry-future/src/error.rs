use std::any::Any;

// ============================================================================
// Error Types (7100+ range - ext_ipc uses 7000)
// ============================================================================

/// Error codes for runner and worker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BridgeErrorCode {
    /// Runner was closed before the operation was scheduled
    RunnerClosed = 7100,
    /// Portal no longer accepts tasks
    PortalClosed = 7101,
    /// No tokio runtime available on the current thread
    NoRuntime = 7102,
    /// Worker thread could not be started
    WorkerSpawn = 7103,
    /// Worker thread panicked
    WorkerPanicked = 7104,
    /// Worker teardown reported errors
    WorkerTeardown = 7105,
}

/// Errors raised while scheduling work on a runner
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("[{code}] Runner closed: {message}")]
    RunnerClosed { code: u32, message: String },

    #[error("[{code}] Portal closed: {message}")]
    PortalClosed { code: u32, message: String },

    #[error("[{code}] No runtime: {message}")]
    NoRuntime { code: u32, message: String },
}

impl RunnerError {
    pub fn runner_closed(message: impl Into<String>) -> Self {
        Self::RunnerClosed {
            code: BridgeErrorCode::RunnerClosed as u32,
            message: message.into(),
        }
    }

    pub fn portal_closed(message: impl Into<String>) -> Self {
        Self::PortalClosed {
            code: BridgeErrorCode::PortalClosed as u32,
            message: message.into(),
        }
    }

    pub fn no_runtime(message: impl Into<String>) -> Self {
        Self::NoRuntime {
            code: BridgeErrorCode::NoRuntime as u32,
            message: message.into(),
        }
    }
}

/// Errors raised by the worker thread that owns a runner session
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("[{code}] Failed to start worker: {message}")]
    Spawn { code: u32, message: String },

    #[error("[{code}] Worker thread panicked: {message}")]
    Panicked { code: u32, message: String },

    #[error("[{code}] Worker teardown failed")]
    Teardown {
        code: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkerError {
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            code: BridgeErrorCode::WorkerSpawn as u32,
            message: message.into(),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            code: BridgeErrorCode::WorkerPanicked as u32,
            message: message.into(),
        }
    }

    pub fn teardown(source: anyhow::Error) -> Self {
        Self::Teardown {
            code: BridgeErrorCode::WorkerTeardown as u32,
            source,
        }
    }
}

/// Exception stored in a pending operation's completion slot
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The operation was cancelled before it produced a value
    #[error("operation cancelled")]
    Cancelled,

    /// The awaitable panicked while being driven
    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl OperationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Extract a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BridgeErrorCode::RunnerClosed as u32, 7100);
        assert_eq!(BridgeErrorCode::PortalClosed as u32, 7101);
        assert_eq!(BridgeErrorCode::NoRuntime as u32, 7102);
        assert_eq!(BridgeErrorCode::WorkerSpawn as u32, 7103);
        assert_eq!(BridgeErrorCode::WorkerPanicked as u32, 7104);
        assert_eq!(BridgeErrorCode::WorkerTeardown as u32, 7105);
    }

    #[test]
    fn test_error_display() {
        let err = RunnerError::runner_closed("runner 3");
        assert_eq!(err.to_string(), "[7100] Runner closed: runner 3");

        let err = WorkerError::teardown(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "[7105] Worker teardown failed");
    }

    #[test]
    fn test_operation_error_conversions() {
        let err: OperationError = anyhow::anyhow!("handler failed").into();
        assert_eq!(err.to_string(), "handler failed");
        assert!(!err.is_cancelled());

        let err: OperationError = RunnerError::portal_closed("gone").into();
        assert!(matches!(err, OperationError::Runner(_)));
        assert!(OperationError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }
}
