//! LIFO stack of weakly referenced closeables.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::error::panic_message;

/// Something the runner stack can close at teardown.
pub trait Close: Send + Sync {
    fn close(&self) -> anyhow::Result<()>;
}

/// Closeables registered during a session, closed in reverse order.
///
/// Entries are held weakly: an entry dropped by its owners before teardown is
/// skipped silently.
#[derive(Default)]
pub struct RunnerStack {
    entries: Vec<Weak<dyn Close>>,
}

impl RunnerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<C: Close + 'static>(&mut self, entry: &Arc<C>) {
        let weak: Weak<C> = Arc::downgrade(entry);
        let weak: Weak<dyn Close> = weak;
        self.entries.push(weak);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every live entry, last pushed first.
    ///
    /// Every entry is attempted even if earlier ones fail; all failures are
    /// returned together.
    pub fn unwind(&mut self) -> Result<(), RunnerStackError> {
        let mut errors = Vec::new();
        while let Some(weak) = self.entries.pop() {
            let Some(entry) = weak.upgrade() else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| entry.close())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(payload) => errors.push(anyhow::anyhow!(
                    "close panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunnerStackError {
                errors,
                cause: None,
            })
        }
    }
}

impl Drop for RunnerStack {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        tracing::warn!(entries = self.entries.len(), "runner stack dropped without unwinding");
        if let Err(err) = self.unwind() {
            tracing::error!(error = ?err, "closing runners from dropped stack failed");
        }
    }
}

/// Every error raised while unwinding a [`RunnerStack`].
#[derive(Debug)]
pub struct RunnerStackError {
    errors: Vec<anyhow::Error>,
    cause: Option<anyhow::Error>,
}

impl RunnerStackError {
    /// Chain the error that triggered the teardown.
    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Close errors, in the order they were raised.
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref()
    }
}

impl fmt::Display for RunnerStackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) while closing runners", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunnerStackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}
