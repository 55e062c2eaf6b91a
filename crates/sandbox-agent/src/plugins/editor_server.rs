//! Editor-support server started as a child process.

use super::{Plugin, PluginContext, PluginError};
use crate::config::{PluginName, RuntimeConfig};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// How long the server must stay up after spawn to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

pub struct EditorServer {
    command: Option<String>,
    args: Vec<String>,
    port: u16,
    token: String,
    child: Option<Child>,
}

impl EditorServer {
    pub fn new(command: impl Into<String>, args: Vec<String>, port: u16) -> Self {
        Self {
            command: Some(command.into()),
            args,
            port,
            token: uuid::Uuid::now_v7().simple().to_string(),
            child: None,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            command: config.editor.command.clone(),
            args: config.editor.args.clone(),
            port: config.editor.port,
            token: uuid::Uuid::now_v7().simple().to_string(),
            child: None,
        }
    }

    /// Connection token handed to clients through `server_info`.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn substitute(&self, template: &str, ctx: &PluginContext) -> String {
        template
            .replace("{port}", &self.port.to_string())
            .replace("{token}", &self.token)
            .replace("{work_dir}", &ctx.work_dir.display().to_string())
    }

    fn start_error(reason: impl Into<String>) -> PluginError {
        PluginError::Start {
            name: PluginName::Editor,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Plugin for EditorServer {
    fn name(&self) -> PluginName {
        PluginName::Editor
    }

    async fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let template = self
            .command
            .clone()
            .ok_or_else(|| Self::start_error("no editor command configured"))?;
        let mut words = template.split_whitespace().map(|word| self.substitute(word, ctx));
        let program = words
            .next()
            .ok_or_else(|| Self::start_error("editor command is empty"))?;
        let mut args: Vec<String> = words.collect();
        args.extend(self.args.iter().map(|arg| self.substitute(arg, ctx)));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(user) = &ctx.username {
            command.env("USER", user);
        }
        let mut child = command
            .spawn()
            .map_err(|err| Self::start_error(format!("{program}: {err}")))?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child
            .try_wait()
            .map_err(|err| Self::start_error(err.to_string()))?
        {
            return Err(Self::start_error(format!(
                "{program} exited immediately with {status}"
            )));
        }
        info!(pid = child.id(), port = self.port, "editor server started");
        self.child = Some(child);
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                debug!(error = %err, "editor server kill failed");
            }
        }
    }
}
