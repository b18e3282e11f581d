//! Command permissions for Ferry apps
//!
//! In dev mode, every command is allowed.
//! In production mode, commands are checked against the manifest's
//! `[permissions.ipc]` patterns.

use std::collections::HashMap;

use ext_ipc::{CommandCapabilityChecker, WebviewWindow};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

/// Permissions section from manifest.app.toml
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Permissions {
    pub ipc: Option<IpcPermissions>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IpcPermissions {
    /// Glob patterns of allowed commands (absent = all commands)
    pub allow: Option<Vec<String>>,
    /// Glob patterns of denied commands, checked before `allow`
    pub deny: Option<Vec<String>>,
    /// Per-window allowlists keyed by window label
    pub windows: Option<HashMap<String, Vec<String>>>,
}

/// Runtime capabilities checker
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub dev_mode: bool,
    allow: Option<GlobSet>,
    deny: Option<GlobSet>,
    windows: HashMap<String, GlobSet>,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Permission denied: {capability} for {resource}")]
    Denied {
        capability: String,
        resource: String,
    },

    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),
}

impl Capabilities {
    /// Create capabilities from manifest permissions
    pub fn from_permissions(
        permissions: Option<&Permissions>,
        dev_mode: bool,
    ) -> Result<Self, CapabilityError> {
        let ipc = permissions
            .and_then(|p| p.ipc.clone())
            .unwrap_or_default();

        let mut windows = HashMap::new();
        for (label, patterns) in ipc.windows.unwrap_or_default() {
            if let Some(set) = Self::compile_patterns(Some(&patterns))? {
                windows.insert(label, set);
            }
        }

        Ok(Self {
            dev_mode,
            allow: Self::compile_patterns(ipc.allow.as_ref())?,
            deny: Self::compile_patterns(ipc.deny.as_ref())?,
            windows,
        })
    }

    fn compile_patterns(
        patterns: Option<&Vec<String>>,
    ) -> Result<Option<GlobSet>, CapabilityError> {
        match patterns {
            None => Ok(None),
            Some(pats) if pats.is_empty() => Ok(None),
            Some(pats) => {
                let mut builder = GlobSetBuilder::new();
                for pat in pats {
                    let glob =
                        Glob::new(pat).map_err(|e| CapabilityError::InvalidPattern(e.to_string()))?;
                    builder.add(glob);
                }
                Ok(Some(builder.build().map_err(|e| {
                    CapabilityError::InvalidPattern(e.to_string())
                })?))
            }
        }
    }

    /// Check whether `command` may be invoked, optionally from window `window`.
    pub fn check_ipc(&self, command: &str, window: Option<&str>) -> Result<(), CapabilityError> {
        if self.dev_mode {
            return Ok(());
        }

        let denied = |capability: String| CapabilityError::Denied {
            capability,
            resource: command.to_string(),
        };

        if self.deny.as_ref().is_some_and(|deny| deny.is_match(command)) {
            return Err(denied("ipc".to_string()));
        }
        if self.allow.as_ref().is_some_and(|allow| !allow.is_match(command)) {
            return Err(denied("ipc".to_string()));
        }
        if let Some(label) = window {
            if let Some(allowed) = self.windows.get(label) {
                if !allowed.is_match(command) {
                    return Err(denied(format!("ipc (window `{label}`)")));
                }
            }
        }
        Ok(())
    }
}

impl CommandCapabilityChecker for Capabilities {
    fn check_command(&self, command: &str, window: Option<&WebviewWindow>) -> Result<(), String> {
        self.check_ipc(command, window.map(WebviewWindow::label))
            .map_err(|e| e.to_string())
    }
}
