//! Long-lived helper processes started next to the shell.

pub mod editor_server;
pub mod kernel;
pub mod kernel_output;

use crate::config::{PluginName, RuntimeConfig};
use agent_api_types::ErrorKind;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub use editor_server::EditorServer;
pub use kernel::PythonKernel;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin `{0}` is not initialized")]
    NotRegistered(PluginName),
    #[error("kernel is not running: {0}")]
    KernelUnavailable(String),
    #[error("Code execution timed out after {0:?}. The kernel was restarted and its state is lost.")]
    CellTimeout(Duration),
    #[error("[You are trying to run the same code twice. Please focus and run the correct code.]")]
    RepeatedFailure,
    #[error("failed to start plugin `{name}`: {reason}")]
    Start { name: PluginName, reason: String },
    #[error("kernel protocol error: {0}")]
    Protocol(String),
    #[error("plugins did not initialize within {0:?}")]
    InitTimeout(Duration),
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::CellTimeout(_) => ErrorKind::Timeout,
            PluginError::RepeatedFailure => ErrorKind::Validation,
            PluginError::NotRegistered(_)
            | PluginError::KernelUnavailable(_)
            | PluginError::Start { .. }
            | PluginError::Protocol(_)
            | PluginError::InitTimeout(_) => ErrorKind::Transport,
        }
    }
}

/// What a plugin learns about its environment at startup.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub work_dir: PathBuf,
    pub username: Option<String>,
}

#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> PluginName;

    async fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    async fn shutdown(&mut self);
}

pub enum PluginHandle {
    Kernel(PythonKernel),
    Editor(EditorServer),
}

impl PluginHandle {
    fn as_plugin_mut(&mut self) -> &mut dyn Plugin {
        match self {
            PluginHandle::Kernel(kernel) => kernel,
            PluginHandle::Editor(editor) => editor,
        }
    }
}

/// Started plugins keyed by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<PluginName, PluginHandle>,
}

impl PluginRegistry {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut registry = Self::default();
        for name in &config.runtime.plugins {
            let handle = match name {
                PluginName::Kernel => PluginHandle::Kernel(PythonKernel::from_config(config)),
                PluginName::Editor => PluginHandle::Editor(EditorServer::from_config(config)),
            };
            registry.insert(handle);
        }
        registry
    }

    pub fn insert(&mut self, mut handle: PluginHandle) {
        let name = handle.as_plugin_mut().name();
        self.plugins.insert(name, handle);
    }

    pub fn names(&self) -> Vec<PluginName> {
        self.plugins.keys().copied().collect()
    }

    /// Start every plugin concurrently under one deadline. Any failure is fatal.
    pub async fn initialize_all(
        &mut self,
        ctx: &PluginContext,
        timeout: Duration,
    ) -> Result<(), PluginError> {
        let pending = self.plugins.values_mut().map(|handle| async move {
            let plugin = handle.as_plugin_mut();
            plugin.initialize(ctx).await?;
            info!(plugin = %plugin.name(), "plugin initialized");
            Ok::<_, PluginError>(())
        });
        tokio::time::timeout(timeout, try_join_all(pending))
            .await
            .map_err(|_| PluginError::InitTimeout(timeout))??;
        Ok(())
    }

    pub fn kernel_mut(&mut self) -> Result<&mut PythonKernel, PluginError> {
        match self.plugins.get_mut(&PluginName::Kernel) {
            Some(PluginHandle::Kernel(kernel)) => Ok(kernel),
            _ => Err(PluginError::NotRegistered(PluginName::Kernel)),
        }
    }

    pub fn editor(&self) -> Option<&EditorServer> {
        match self.plugins.get(&PluginName::Editor) {
            Some(PluginHandle::Editor(editor)) => Some(editor),
            _ => None,
        }
    }

    pub async fn shutdown_all(&mut self) {
        for handle in self.plugins.values_mut() {
            handle.as_plugin_mut().shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_lookup_without_plugins() {
        let mut registry = PluginRegistry::default();
        let err = registry
            .kernel_mut()
            .err()
            .expect("no kernel is registered");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "plugin `kernel` is not initialized");
        assert!(registry.editor().is_none());
    }

    #[test]
    fn test_registry_follows_config() {
        let mut config = RuntimeConfig::default();
        config.runtime.plugins = vec![PluginName::Kernel];
        let mut registry = PluginRegistry::from_config(&config);
        assert_eq!(registry.names(), vec![PluginName::Kernel]);
        assert!(registry.kernel_mut().is_ok());
    }

    #[tokio::test]
    async fn test_initialize_all_with_no_plugins() {
        let mut registry = PluginRegistry::default();
        let ctx = PluginContext {
            work_dir: std::env::temp_dir(),
            username: None,
        };
        registry
            .initialize_all(&ctx, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
