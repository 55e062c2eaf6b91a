//! Inbound actions. One action in, one observation out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Line-range sentinel meaning "from the first line".
pub const WHOLE_FILE_START: i64 = 0;
/// Line-range sentinel meaning "through the last line".
pub const WHOLE_FILE_END: i64 = -1;

fn whole_file_end() -> i64 {
    WHOLE_FILE_END
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    RunCommand(RunCommand),
    RunCodeCell(RunCodeCell),
    ReadFile(ReadFile),
    WriteFile(WriteFile),
    EditFile(EditFile),
    EditLines(EditLines),
}

/// Closed set of action tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RunCommand,
    RunCodeCell,
    ReadFile,
    WriteFile,
    EditFile,
    EditLines,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RunCommand => "run_command",
            ActionKind::RunCodeCell => "run_code_cell",
            ActionKind::ReadFile => "read_file",
            ActionKind::WriteFile => "write_file",
            ActionKind::EditFile => "edit_file",
            ActionKind::EditLines => "edit_lines",
        }
    }

    /// Whether the action may change the filesystem through the file handler.
    pub fn mutates_files(&self) -> bool {
        matches!(
            self,
            ActionKind::WriteFile | ActionKind::EditFile | ActionKind::EditLines
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::RunCommand(_) => ActionKind::RunCommand,
            Action::RunCodeCell(_) => ActionKind::RunCodeCell,
            Action::ReadFile(_) => ActionKind::ReadFile,
            Action::WriteFile(_) => ActionKind::WriteFile,
            Action::EditFile(_) => ActionKind::EditFile,
            Action::EditLines(_) => ActionKind::EditLines,
        }
    }

    /// Caller-supplied timeout, when the action carries one. Zero and negative
    /// values mean "no timeout"; values a [`Duration`] cannot hold are rejected.
    pub fn timeout(&self) -> Result<Option<Duration>, InvalidTimeout> {
        let secs = match self {
            Action::RunCommand(action) => action.timeout,
            Action::RunCodeCell(action) => action.timeout,
            _ => None,
        };
        match secs {
            Some(secs) if secs.is_nan() => Err(InvalidTimeout(secs)),
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|_| InvalidTimeout(secs)),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("invalid timeout {0}: expected a finite number of seconds")]
pub struct InvalidTimeout(pub f64);

/// Run a command in the persistent shell, or feed input to the one still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommand {
    pub command: String,
    /// Send `command` to the running process instead of starting a new command.
    #[serde(default)]
    pub is_input: bool,
    /// Hard timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Wait for completion without the no-change timeout.
    #[serde(default)]
    pub blocking: bool,
}

impl RunCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            is_input: false,
            timeout: None,
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCodeCell {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadFile {
    pub path: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "whole_file_end")]
    pub end: i64,
}

impl ReadFile {
    pub fn whole(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            start: WHOLE_FILE_START,
            end: WHOLE_FILE_END,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "whole_file_end")]
    pub end: i64,
}

impl WriteFile {
    pub fn whole(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            start: WHOLE_FILE_START,
            end: WHOLE_FILE_END,
        }
    }
}

/// String replacement edit. `old_str` must be unique unless `replace_all` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditFile {
    pub path: String,
    pub old_str: String,
    pub new_str: String,
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditLines {
    pub path: String,
    pub edit: LineEdit,
}

/// Line-addressed edits. Line numbers are 1-indexed and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LineEdit {
    Replace {
        start: usize,
        end: usize,
        content: String,
    },
    InsertBefore {
        line: usize,
        content: String,
    },
    InsertAfter {
        line: usize,
        content: String,
    },
    Append {
        content: String,
    },
    Delete {
        start: usize,
        end: usize,
    },
}
