//! Persistent interactive shell for the sandbox runtime.
//!
//! A [`ShellSession`] owns one bash process behind a [`Terminal`], installs a
//! [`PromptSentinel`] as its prompt and turns the raw byte stream into one
//! observation per command. The [`ShellBackend`] trait is the seam the
//! dispatcher talks to, so a framed backend can replace the polling session.

pub mod keys;
pub mod sentinel;
pub mod session;
pub mod splitter;
pub mod terminal;

pub use sentinel::{PromptFields, PromptSentinel, SentinelMatch};
pub use session::{SessionState, ShellSession, CONTINUATION_PREFIX};
pub use splitter::{
    escape_special_chars, parse_strict, split_commands, syntax_issues, SplitError, SyntaxIssue,
};
pub use terminal::{PtyExitStatus, PtyTerminal, Terminal};

use agent_api_types::Observation;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Prepended to the inherited PATH.
    pub extra_path: Vec<String>,
    pub no_change_timeout: Duration,
    /// Wall-clock ceiling for a request that carries no timeout of its own.
    pub default_hard_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    /// Run once after the prompt is installed; each must exit 0.
    pub init_commands: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "/bin/bash".to_string(),
            args: vec![
                "--noprofile".to_string(),
                "--norc".to_string(),
                "--noediting".to_string(),
            ],
            work_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: BTreeMap::new(),
            extra_path: Vec::new(),
            no_change_timeout: Duration::from_secs(30),
            default_hard_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(30),
            init_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    pub is_input: bool,
    pub hard_timeout: Option<Duration>,
    /// Disable the no-change timeout.
    pub blocking: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            is_input: false,
            hard_timeout: None,
            blocking: false,
        }
    }

    pub fn input(command: impl Into<String>) -> Self {
        Self {
            is_input: true,
            ..Self::new(command)
        }
    }
}

/// Failures that end the session. Everything recoverable is an observation.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("shell did not print its prompt within {0:?}")]
    StartupTimeout(Duration),
    #[error("init command `{command}` exited with {exit_code}: {output}")]
    InitCommand {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("shell process exited ({status}); last output: {output}")]
    ProcessExited { status: String, output: String },
    #[error("shell i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What the dispatcher needs from a shell.
pub trait ShellBackend: Send {
    fn execute(&mut self, request: &CommandRequest) -> Result<Observation, ShellError>;

    /// Working directory reported by the most recent prompt.
    fn cwd(&self) -> &Path;

    fn is_alive(&mut self) -> bool;

    fn close(&mut self);
}
