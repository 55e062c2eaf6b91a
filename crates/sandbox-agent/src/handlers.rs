//! One handler per action type.

use crate::dispatcher::RuntimeState;
use crate::error::RuntimeError;
use crate::files::FileOperations;
use agent_api_types::{
    Action, EditFile, EditLines, Observation, ReadFile, RunCodeCell, RunCommand, WriteFile,
};
use async_trait::async_trait;
use sandbox_shell::CommandRequest;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// `timeout` is the action's own timeout, already validated.
    async fn run(
        &self,
        state: &mut RuntimeState,
        timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError>;
}

/// Route `action` to its handler. The match is exhaustive over [`Action`].
pub async fn route(action: &Action, state: &mut RuntimeState) -> Result<Observation, RuntimeError> {
    let timeout = action
        .timeout()
        .map_err(|err| RuntimeError::Validation(err.to_string()))?;
    match action {
        Action::RunCommand(action) => action.run(state, timeout).await,
        Action::RunCodeCell(action) => action.run(state, timeout).await,
        Action::ReadFile(action) => action.run(state, timeout).await,
        Action::WriteFile(action) => action.run(state, timeout).await,
        Action::EditFile(action) => action.run(state, timeout).await,
        Action::EditLines(action) => action.run(state, timeout).await,
    }
}

#[async_trait]
impl ActionHandler for RunCommand {
    async fn run(
        &self,
        state: &mut RuntimeState,
        timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError> {
        if !self.is_input {
            state
                .policy
                .check_command(&self.command, &state.cwd)
                .map_err(RuntimeError::Policy)?;
        }
        let request = CommandRequest {
            command: self.command.clone(),
            is_input: self.is_input,
            hard_timeout: timeout,
            blocking: self.blocking,
        };
        let shell = Arc::clone(&state.shell);
        let (observation, cwd) = tokio::task::spawn_blocking(move || {
            let mut shell = shell
                .lock()
                .map_err(|_| RuntimeError::Worker("shell lock poisoned".into()))?;
            let observation = shell.execute(&request)?;
            Ok::<_, RuntimeError>((observation, shell.cwd().to_path_buf()))
        })
        .await??;
        state.cwd = cwd;
        Ok(observation)
    }
}

#[async_trait]
impl ActionHandler for RunCodeCell {
    async fn run(
        &self,
        state: &mut RuntimeState,
        timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError> {
        state
            .policy
            .check_code(&self.code, &state.cwd)
            .map_err(RuntimeError::Policy)?;
        let cwd = state.cwd.clone();
        let kernel = state.plugins.kernel_mut()?;
        Ok(kernel.run_cell(&self.code, &cwd, timeout).await?)
    }
}

/// Run a file operation on the blocking pool.
async fn with_files<F>(state: &RuntimeState, op: F) -> Result<Observation, RuntimeError>
where
    F: FnOnce(&mut FileOperations, PathBuf) -> Result<Observation, crate::files::FileOpError>
        + Send
        + 'static,
{
    let files: Arc<Mutex<FileOperations>> = Arc::clone(&state.files);
    let cwd = state.cwd.clone();
    tokio::task::spawn_blocking(move || {
        let mut files = files
            .lock()
            .map_err(|_| RuntimeError::Worker("file handler lock poisoned".into()))?;
        Ok::<_, RuntimeError>(op(&mut files, cwd)?)
    })
    .await?
}

#[async_trait]
impl ActionHandler for ReadFile {
    async fn run(
        &self,
        state: &mut RuntimeState,
        _timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError> {
        let action = self.clone();
        with_files(state, move |files, cwd| files.read(&cwd, &action)).await
    }
}

#[async_trait]
impl ActionHandler for WriteFile {
    async fn run(
        &self,
        state: &mut RuntimeState,
        _timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError> {
        let action = self.clone();
        with_files(state, move |files, cwd| files.write(&cwd, &action)).await
    }
}

#[async_trait]
impl ActionHandler for EditFile {
    async fn run(
        &self,
        state: &mut RuntimeState,
        _timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError> {
        let action = self.clone();
        with_files(state, move |files, cwd| files.edit(&cwd, &action)).await
    }
}

#[async_trait]
impl ActionHandler for EditLines {
    async fn run(
        &self,
        state: &mut RuntimeState,
        _timeout: Option<Duration>,
    ) -> Result<Observation, RuntimeError> {
        let action = self.clone();
        with_files(state, move |files, cwd| files.edit_lines(&cwd, &action)).await
    }
}
