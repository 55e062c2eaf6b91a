//! Observations returned for every action.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum Observation {
    CommandOutput(CommandOutput),
    CodeOutput(CodeOutput),
    FileRead(FileRead),
    FileWrite(FileWrite),
    FileEdit(FileEdit),
    Error(ErrorObservation),
}

impl Observation {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Observation::Error(ErrorObservation {
            kind,
            message: message.into(),
        })
    }

    /// Text the dispatcher normalizes before returning.
    pub fn content(&self) -> &str {
        match self {
            Observation::CommandOutput(obs) => &obs.content,
            Observation::CodeOutput(obs) => &obs.content,
            Observation::FileRead(obs) => &obs.content,
            Observation::FileWrite(obs) => &obs.content,
            Observation::FileEdit(obs) => &obs.content,
            Observation::Error(obs) => &obs.message,
        }
    }

    /// Mutable access to terminal-facing text. File reads are excluded so that
    /// ranged reads and data URLs stay byte-exact.
    pub fn terminal_text_mut(&mut self) -> Option<&mut String> {
        match self {
            Observation::CommandOutput(obs) => Some(&mut obs.content),
            Observation::CodeOutput(obs) => Some(&mut obs.content),
            Observation::Error(obs) => Some(&mut obs.message),
            Observation::FileRead(_) | Observation::FileWrite(_) | Observation::FileEdit(_) => {
                None
            }
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Observation::Error(obs) => Some(obs.kind),
            _ => None,
        }
    }

    /// Only a dead shell ends the runtime instance.
    pub fn is_session_fatal(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Process)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub content: String,
    pub command: String,
    pub exit_code: i32,
    pub metadata: CommandMetadata,
}

/// How a shell command invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Completed,
    NoChangeTimeout,
    HardTimeout,
    NotExecuted,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Completed => "completed",
            CommandStatus::NoChangeTimeout => "no_change_timeout",
            CommandStatus::HardTimeout => "hard_timeout",
            CommandStatus::NotExecuted => "not_executed",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CommandStatus::NoChangeTimeout | CommandStatus::HardTimeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommandMetadata {
    /// Value of `$!` reported by the prompt.
    pub pid: Option<i64>,
    pub working_dir: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub duration_ms: u64,
    /// Whether the sentinel prompt closed this output.
    pub prompt_found: bool,
    pub status: CommandStatus,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeOutput {
    pub content: String,
    pub code: String,
    /// Image payloads pulled out of the text output, as data URLs.
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRead {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
    pub prev_exist: bool,
    pub old_content: Option<String>,
    pub new_content: String,
    /// Unified diff of old against new content.
    pub diff: String,
    pub cursor_line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObservation {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error taxonomy. Only `Process` is fatal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Process,
    Timeout,
    Validation,
    LintRegression,
    Encoding,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Process => "process",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::LintRegression => "lint_regression",
            ErrorKind::Encoding => "encoding",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
