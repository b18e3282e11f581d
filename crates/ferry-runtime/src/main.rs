//! Ferry Runtime - Headless host for async command dispatch
//!
//! The runtime plays the part of a GUI event loop: it reads invoke requests
//! as JSON lines on stdin, hands each one to the [`InvokeHandler`] without
//! blocking, and writes every response as a JSON line on stdout. Commands run
//! on a dedicated worker thread that owns the async runtime.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────┐  JSON lines  ┌──────────────────┐   Runner    ┌──────────────────┐
//! │    stdin     │─────────────►│   Native loop    │────────────►│  Worker thread   │
//! │ (reader thr.)│              │ (main thread)    │             │ LocalSet + tasks │
//! └──────────────┘              └────────┬─────────┘◄────────────┴──────────────────┘
//!                                        │             responders
//!                                        ▼
//!                                 stdout (JSON lines)
//! ```
//!
//! # Initialization Flow
//!
//! 1. **Parse arguments** - `--app-dir <path>` and `--dev`
//! 2. **Parse manifest.app.toml** - App metadata, worker settings, permissions
//! 3. **Initialize capabilities** - Compile the `[permissions.ipc]` patterns
//! 4. **Start the worker** - Spawn the worker thread and obtain its runner
//! 5. **Register commands** - Freeze the registry into an invoke handler
//! 6. **Run the native loop** - Until stdin closes and every request is answered
//! 7. **Shut down** - Unwind the worker's runners and join the thread
//!
//! # Wire Format
//!
//! ```text
//! → {"id":1,"command":"greet","body":"{\"name\":\"World\"}","window":"main"}
//! ← {"id":1,"ok":"{\"message\":\"Hello, World!\"}"}
//! → {"id":2,"command":"nope"}
//! ← {"id":2,"error":"no command handler `nope` found"}
//! ```
//!
//! # Environment Variables
//!
//! - `FERRY_LOG` - Log level (default: "info"); logs go to stderr

mod capabilities;
mod commands;
mod manifest;
mod native;

use std::env;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ext_ipc::{AppHandle, Commands, InvokeHandler};
use ferry_future::Worker;

use crate::capabilities::Capabilities;
use crate::manifest::Manifest;
use crate::native::NativeLoop;

const USAGE: &str = "Usage: ferry-runtime --app-dir <path> [--dev]";

/// Command line options
#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    app_dir: PathBuf,
    dev_mode: bool,
}

fn parse_args<I>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut app_dir: Option<PathBuf> = None;
    let mut dev_mode = false;
    while let Some(a) = args.next() {
        match a.as_str() {
            "--app-dir" => {
                let dir = args
                    .next()
                    .with_context(|| format!("--app-dir requires a path\n{USAGE}"))?;
                app_dir = Some(PathBuf::from(dir));
            }
            "--dev" => {
                dev_mode = true;
            }
            other => {
                tracing::warn!(argument = other, "Ignoring unknown argument");
            }
        }
    }

    let Some(app_dir) = app_dir else {
        anyhow::bail!(USAGE);
    };
    Ok(Args { app_dir, dev_mode })
}

fn main() -> Result<()> {
    // Initialize tracing with env-filter support
    // Use FERRY_LOG env var for log level configuration, default to "info"
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("FERRY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = parse_args(env::args().skip(1))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating startup runtime")?;
    let manifest = rt.block_on(Manifest::load(&args.app_dir))?;
    drop(rt);

    tracing::info!(
        "Starting app: {} v{}",
        manifest.app.name,
        manifest.app.version
    );

    let capabilities = Capabilities::from_permissions(manifest.permissions.as_ref(), args.dev_mode)
        .context("initializing capabilities")?;
    if capabilities.dev_mode {
        tracing::info!("Dev mode: all commands allowed");
    }

    let worker = Worker::spawn(manifest.worker_config()).context("starting worker")?;

    let mut commands = Commands::new();
    commands::register(&mut commands)?;
    let handler: InvokeHandler = commands
        .generate_handler(worker.runner().clone())
        .with_checker(Arc::new(capabilities));
    tracing::debug!(commands = ?handler.commands().names(), "Commands registered");

    let native = NativeLoop::new(
        handler,
        AppHandle::new(manifest.app.info()),
        manifest.drain_timeout(),
    );
    native.spawn_reader(BufReader::new(io::stdin()))?;

    let stdout = io::stdout();
    let result = native.run(&mut stdout.lock());

    worker.shutdown().context("shutting down worker")?;

    let stats = result?;
    tracing::info!(
        requests = stats.requests,
        resolved = stats.resolved,
        rejected = stats.rejected,
        malformed = stats.malformed,
        cancelled = stats.cancelled,
        channel_messages = stats.channel_messages,
        "Native loop finished"
    );
    Ok(())
}
