//! Sandbox action runtime: a persistent shell, file operations and code
//! plugins behind one serialized action dispatcher.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod handlers;
pub mod logging;
pub mod monitor;
pub mod plugins;
pub mod policy;
pub mod transport;

pub use config::RuntimeConfig;
pub use dispatcher::{ActionDispatcher, RuntimeState};
pub use error::RuntimeError;

use anyhow::{bail, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;

/// Entry point of the `sandbox-runtime` binary.
pub async fn run_sandbox_agent() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = RuntimeConfig::resolve(&cli)?;
    let _log_guard = logging::init(config.logging.dir.as_deref())?;
    tracing::info!(
        work_dir = %config.work_dir().display(),
        plugins = ?config.runtime.plugins,
        "starting sandbox runtime"
    );

    let dispatcher = Arc::new(ActionDispatcher::start(&config).await?);
    let stdin = BufReader::new(tokio::io::stdin());
    transport::serve(Arc::clone(&dispatcher), stdin, tokio::io::stdout()).await?;
    dispatcher.shutdown().await;

    if dispatcher.is_fatal() {
        bail!("shell session ended unexpectedly");
    }
    Ok(())
}
