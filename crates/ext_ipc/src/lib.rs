//! ext_ipc - Command dispatch between the native event loop and async handlers
//!
//! # Flow
//!
//! ```text
//! native thread                          worker thread
//! ─────────────                          ─────────────
//! Invoke ──► InvokeHandler::handle
//!              ├─ capability check ──► reject
//!              ├─ registry lookup  ──► reject (unknown command)
//!              ├─ Invoke::bind_to  ──► reject (binding failed)
//!              └─ Runner::schedule ──────► run_command
//!                                           ├─ resolve(bytes)
//!                                           ├─ reject(message)
//!                                           └─ Channel::send ──► ChannelSink (any time)
//! ```
//!
//! Commands are registered on [`Commands`] before the app runs and frozen
//! into an [`InvokeHandler`] with [`Commands::generate_handler`].
//!
//! # Error Codes
//!
//! Registry and permission errors use the 7000 range, see [`IpcErrorCode`].

mod channel;
mod commands;
mod handler;
mod invoke;
mod model;

pub use channel::{Channel, ChannelId, ChannelSink, CHANNEL_PREFIX};
pub use commands::{
    CommandEntry, CommandError, CommandResult, Commands, DispatchError, FromArguments, Handler,
    HandlerFn, HandlerFuture,
};
pub use handler::{CommandCapabilityChecker, InvokeHandler, PermissiveChecker};
pub use invoke::{
    AppHandle, AppInfo, Arguments, BindError, Invoke, InvokeBody, InvokeContext, InvokeResolver,
    InvokeResponse, Parameter, ParameterSet, WebviewWindow,
};
pub use model::{Body, Deserializable, Json, ModelError, Serializable};

// ============================================================================
// Error Types (7000+ range - ferry-future uses 7100)
// ============================================================================

/// Error codes for IPC registry operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpcErrorCode {
    /// Command name already registered
    DuplicateCommand = 7000,
    /// Parameter name outside the supported vocabulary
    UnknownParameter = 7001,
    /// Parameter declared more than once
    DuplicateParameter = 7002,
    /// Handler has no usable name
    UnnamedHandler = 7003,
    /// Permission denied by capability system
    PermissionDenied = 7004,
    /// String is not a `__CHANNEL__:<id>` channel id
    InvalidChannelId = 7005,
    /// Window has no channel delivery
    ChannelUnavailable = 7006,
    /// Channel message could not be delivered
    ChannelSend = 7007,
}

/// Custom error type for IPC operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    #[error("[{code}] Command `{name}` already exists. If it's expected, use `set_command` instead.")]
    DuplicateCommand { code: u32, name: String },

    #[error("[{code}] Unknown parameter `{name}`, expected one of: body, app_handle, webview_window")]
    UnknownParameter { code: u32, name: String },

    #[error("[{code}] Parameter `{name}` declared more than once")]
    DuplicateParameter { code: u32, name: String },

    #[error("[{code}] Cannot derive a command name from `{type_name}`, use `command` instead")]
    UnnamedHandler { code: u32, type_name: String },

    #[error("[{code}] Permission denied: {message}")]
    PermissionDenied { code: u32, message: String },

    #[error("[{code}] Invalid channel id `{value}`, expected `__CHANNEL__:<id>`")]
    InvalidChannelId { code: u32, value: String },

    #[error("[{code}] Window `{window}` cannot deliver channel messages")]
    ChannelUnavailable { code: u32, window: String },

    #[error("[{code}] Failed to send on channel {channel}: {reason}")]
    ChannelSend {
        code: u32,
        channel: u32,
        reason: String,
    },
}

impl IpcError {
    pub fn duplicate_command(name: impl Into<String>) -> Self {
        Self::DuplicateCommand {
            code: IpcErrorCode::DuplicateCommand as u32,
            name: name.into(),
        }
    }

    pub fn unknown_parameter(name: impl Into<String>) -> Self {
        Self::UnknownParameter {
            code: IpcErrorCode::UnknownParameter as u32,
            name: name.into(),
        }
    }

    pub fn duplicate_parameter(name: impl Into<String>) -> Self {
        Self::DuplicateParameter {
            code: IpcErrorCode::DuplicateParameter as u32,
            name: name.into(),
        }
    }

    pub fn unnamed_handler(type_name: impl Into<String>) -> Self {
        Self::UnnamedHandler {
            code: IpcErrorCode::UnnamedHandler as u32,
            type_name: type_name.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            code: IpcErrorCode::PermissionDenied as u32,
            message: message.into(),
        }
    }

    pub fn invalid_channel_id(value: impl Into<String>) -> Self {
        Self::InvalidChannelId {
            code: IpcErrorCode::InvalidChannelId as u32,
            value: value.into(),
        }
    }

    pub fn channel_unavailable(window: impl Into<String>) -> Self {
        Self::ChannelUnavailable {
            code: IpcErrorCode::ChannelUnavailable as u32,
            window: window.into(),
        }
    }

    pub fn channel_send(channel: u32, reason: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: IpcErrorCode::ChannelSend as u32,
            channel,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Test Support
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(IpcErrorCode::DuplicateCommand as u32, 7000);
        assert_eq!(IpcErrorCode::UnknownParameter as u32, 7001);
        assert_eq!(IpcErrorCode::DuplicateParameter as u32, 7002);
        assert_eq!(IpcErrorCode::UnnamedHandler as u32, 7003);
        assert_eq!(IpcErrorCode::PermissionDenied as u32, 7004);
        assert_eq!(IpcErrorCode::InvalidChannelId as u32, 7005);
        assert_eq!(IpcErrorCode::ChannelUnavailable as u32, 7006);
        assert_eq!(IpcErrorCode::ChannelSend as u32, 7007);
    }

    #[test]
    fn test_error_display() {
        let err = IpcError::duplicate_command("greet");
        assert!(err.to_string().contains("7000"));
        assert!(err.to_string().contains("`greet` already exists"));

        let err = IpcError::unknown_parameter("request");
        assert!(err.to_string().contains("7001"));
        assert!(err.to_string().contains("request"));

        let err = IpcError::permission_denied("command blocked");
        assert!(err.to_string().contains("7004"));
        assert!(err.to_string().contains("command blocked"));
    }

    #[test]
    fn test_captured_logs_are_thread_local() {
        let (logs, _guard) = test_support::capture_logs();
        tracing::error!("on this thread");
        std::thread::spawn(|| tracing::error!("elsewhere"))
            .join()
            .unwrap();
        assert_eq!(logs.messages(tracing::Level::ERROR), vec!["on this thread".to_string()]);
    }
}
