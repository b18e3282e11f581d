use std::thread;

use tokio::runtime::Handle;

use crate::error::RunnerError;
use crate::portal::{Portal, TaskGroup};
use crate::runner::Runner;
use crate::stack::RunnerStack;

/// Owns one worker session: task group, portal and the runners built on them.
///
/// ```text
/// enter()     → task group + portal opened on the current LocalSet
/// build()     → Runner pushed on the stack (weakly)
/// shutdown()  → runners closed LIFO → portal closed → tasks cancelled and drained
/// ```
pub struct RunnerBuilder {
    group: TaskGroup,
    portal: Portal,
    stack: RunnerStack,
}

impl RunnerBuilder {
    /// Open a session on the current thread.
    ///
    /// Must be called from inside the worker's `LocalSet`.
    pub fn enter() -> Result<Self, RunnerError> {
        Handle::try_current().map_err(|e| RunnerError::no_runtime(e.to_string()))?;
        let group = TaskGroup::new();
        let portal = Portal::open(&group);
        tracing::debug!(thread = ?thread::current().id(), "runner session entered");
        Ok(Self {
            group,
            portal,
            stack: RunnerStack::new(),
        })
    }

    /// Create a runner bound to this session.
    pub fn build(&mut self) -> Runner {
        let runner = Runner::new(thread::current().id(), self.group.clone(), self.portal.clone());
        self.stack.push(runner.shared());
        tracing::debug!(runner = runner.id(), "runner built");
        runner
    }

    pub fn portal(&self) -> &Portal {
        &self.portal
    }

    pub fn task_group(&self) -> &TaskGroup {
        &self.group
    }

    /// Tear the session down.
    ///
    /// `cause` is the error that ended the session, if any. Close errors are
    /// returned as a [`RunnerStackError`](crate::RunnerStackError) chained to
    /// `cause`.
    pub async fn shutdown(mut self, cause: Option<anyhow::Error>) -> anyhow::Result<()> {
        let closing = self.stack.unwind();
        self.portal.close();
        self.group.cancel();
        self.group.wait().await;
        tracing::debug!("runner session closed");

        match (closing, cause) {
            (Err(errors), Some(cause)) => Err(errors.with_cause(cause).into()),
            (Err(errors), None) => Err(errors.into()),
            (Ok(()), Some(cause)) => Err(cause),
            (Ok(()), None) => Ok(()),
        }
    }
}
