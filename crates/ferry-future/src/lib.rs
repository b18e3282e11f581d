//! ferry-future - Cross-thread future bridge
//!
//! Hands async work from a native thread that must never block to a worker
//! thread running a current-thread tokio runtime, and delivers each outcome
//! back exactly once.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐  schedule()   ┌──────────────────────────────────┐
//! │   native thread   │──────────────►│ worker thread (runtime+LocalSet) │
//! │                   │   Portal      │  TaskGroup ─ CancelScope per task │
//! │ BridgeFuture /    │               │  drive(): settle Completion once  │
//! │ Completion waiter │◄──────────────│                                  │
//! └───────────────────┘   waker       └──────────────────────────────────┘
//! ```
//!
//! - [`PendingOperation`] / [`Completion`]: awaitable plus its write-once slot
//! - [`Runner`]: picks the same-thread or portal path and returns a [`CancelHandle`]
//! - [`RunnerBuilder`] / [`RunnerStack`]: session lifecycle, runners closed LIFO
//! - [`Worker`]: owns the worker thread and its session
//!
//! # Error Codes
//!
//! Bridge errors use the 7100 range, see [`BridgeErrorCode`].

mod builder;
mod error;
mod future;
mod pending;
mod portal;
mod runner;
mod stack;
mod worker;

pub use builder::RunnerBuilder;
pub use error::{panic_message, BridgeErrorCode, OperationError, RunnerError, WorkerError};
pub use future::{BridgeFuture, CancelOnDrop};
pub use pending::{Completion, PendingOperation};
pub use portal::{CancelScope, Portal, PortalTask, TaskGroup};
pub use runner::{CancelHandle, ClosedNotificator, Runner};
pub use stack::{Close, RunnerStack, RunnerStackError};
pub use worker::{Worker, WorkerConfig};
