use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ext_ipc::AppInfo;
use ferry_future::WorkerConfig;
use serde::Deserialize;

use crate::capabilities::Permissions;

/// How long the native loop waits for outstanding commands at EOF (default: 5s)
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Application manifest (manifest.app.toml)
///
/// Defines app metadata, worker settings and command permissions.
/// Loaded at runtime startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Manifest {
    /// App metadata (name, version, identifier)
    pub app: App,
    /// Worker thread settings (optional)
    pub worker: Option<Worker>,
    /// Permissions/capabilities section. Accepts both `permissions` and `capabilities` keys.
    #[serde(alias = "capabilities")]
    pub permissions: Option<Permissions>,
}

/// Application metadata
#[derive(Debug, Deserialize, Clone)]
pub struct App {
    /// Display name of the application
    pub name: String,
    /// Unique identifier (reverse-DNS format, e.g., "com.example.myapp")
    pub identifier: String,
    /// Semantic version (e.g., "1.0.0")
    pub version: String,
}

/// Worker thread settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Worker {
    /// OS thread name (default: "ferry-worker")
    pub thread_name: Option<String>,
    /// Grace period for outstanding commands at shutdown, in milliseconds
    pub drain_timeout_ms: Option<u64>,
}

impl Manifest {
    pub const FILE_NAME: &'static str = "manifest.app.toml";

    /// Read `<app_dir>/manifest.app.toml`.
    pub async fn load(app_dir: &Path) -> Result<Self> {
        let manifest_path = app_dir.join(Self::FILE_NAME);
        let manifest_txt = tokio::fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("reading manifest at {}", manifest_path.display()))?;
        Self::parse(&manifest_txt)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing manifest")
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        if let Some(name) = self.worker.as_ref().and_then(|w| w.thread_name.clone()) {
            config.thread_name = name;
        }
        config
    }

    pub fn drain_timeout(&self) -> Duration {
        let millis = self
            .worker
            .as_ref()
            .and_then(|w| w.drain_timeout_ms)
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS);
        Duration::from_millis(millis)
    }
}

impl App {
    pub fn info(&self) -> AppInfo {
        AppInfo {
            name: self.name.clone(),
            identifier: self.identifier.clone(),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo_manifest() {
        let manifest = Manifest::parse(include_str!("../app/manifest.app.toml")).unwrap();
        assert_eq!(manifest.app.name, "Ferry Demo");
        assert_eq!(manifest.worker_config().thread_name, "ferry-worker");
        assert_eq!(manifest.drain_timeout(), Duration::from_millis(2000));

        let ipc = manifest.permissions.unwrap().ipc.unwrap();
        assert!(ipc.allow.unwrap().contains(&"greet".to_string()));
        assert!(ipc.windows.unwrap().contains_key("settings"));
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let manifest = Manifest::parse(
            r#"
            [app]
            name = "Minimal"
            identifier = "com.example.minimal"
            version = "1.0.0"
            "#,
        )
        .unwrap();
        assert!(manifest.permissions.is_none());
        assert_eq!(manifest.worker_config().thread_name, "ferry-worker");
        assert_eq!(manifest.drain_timeout(), Duration::from_secs(5));
        assert_eq!(manifest.app.info().identifier, "com.example.minimal");
    }

    #[test]
    fn test_capabilities_alias() {
        let manifest = Manifest::parse(
            r#"
            [app]
            name = "Alias"
            identifier = "com.example.alias"
            version = "1.0.0"

            [capabilities.ipc]
            deny = ["sleep"]
            "#,
        )
        .unwrap();
        let ipc = manifest.permissions.unwrap().ipc.unwrap();
        assert_eq!(ipc.deny.unwrap(), vec!["sleep".to_string()]);
    }

    #[test]
    fn test_missing_app_section_fails() {
        let err = Manifest::parse("[worker]\nthread_name = \"w\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("parsing manifest"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Manifest::load(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reading manifest"));
    }
}
