//! Shared action/observation models and error types for the sandbox runtime.

mod action;
mod observation;

pub use action::{
    Action, ActionKind, EditFile, EditLines, InvalidTimeout, LineEdit, ReadFile, RunCodeCell, RunCommand,
    WriteFile, WHOLE_FILE_END, WHOLE_FILE_START,
};
pub use observation::{
    CodeOutput, CommandMetadata, CommandOutput, CommandStatus, ErrorKind, ErrorObservation,
    FileEdit, FileRead, FileWrite, Observation,
};

use serde::{Deserialize, Serialize};

/// One line on the inbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Request {
    Action { id: u64, action: Action },
    Query { id: u64, query: Query },
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::Action { id, .. } | Request::Query { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Alive,
    ServerInfo,
}

/// One line on the outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Observation {
        id: Option<u64>,
        observation: Observation,
    },
    Info {
        id: u64,
        info: serde_json::Value,
    },
}

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("bad_request: {0}")]
    BadRequest(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    /// Decode one request line, keeping the id when only the body is malformed.
    pub fn decode_request(line: &str) -> Result<Request, (Option<u64>, ApiError)> {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => Ok(request),
            Err(err) => {
                let id = serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|value| value.get("id").and_then(|id| id.as_u64()));
                Err((id, ApiError::BadRequest(err.to_string())))
            }
        }
    }

    pub fn into_observation(self) -> Observation {
        Observation::error(ErrorKind::Transport, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_run_command_defaults() {
        let action: Action =
            serde_json::from_value(json!({"action": "run_command", "command": "ls"})).unwrap();
        assert_eq!(action, Action::RunCommand(RunCommand::new("ls")));
        assert_eq!(action.kind(), ActionKind::RunCommand);
        assert_eq!(action.timeout(), Ok(None));
    }

    #[test]
    fn test_read_file_defaults_to_whole_file() {
        let action: Action =
            serde_json::from_value(json!({"action": "read_file", "path": "/tmp/a.txt"})).unwrap();
        match action {
            Action::ReadFile(read) => {
                assert_eq!(read.start, WHOLE_FILE_START);
                assert_eq!(read.end, WHOLE_FILE_END);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_edit_lines_nested_op() {
        let action: Action = serde_json::from_value(json!({
            "action": "edit_lines",
            "path": "a.py",
            "edit": {"op": "insert_after", "line": 3, "content": "x = 1\n"}
        }))
        .unwrap();
        assert_eq!(action.kind(), ActionKind::EditLines);
        assert!(action.kind().mutates_files());
        match action {
            Action::EditLines(edit) => assert_eq!(
                edit.edit,
                LineEdit::InsertAfter {
                    line: 3,
                    content: "x = 1\n".into()
                }
            ),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_tag_is_rejected() {
        let result = serde_json::from_value::<Action>(json!({"action": "browse", "url": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_timeout_ignores_non_positive_values() {
        let mut cmd = RunCommand::new("sleep 1");
        cmd.timeout = Some(0.0);
        assert_eq!(Action::RunCommand(cmd.clone()).timeout(), Ok(None));
        cmd.timeout = Some(-3.0);
        assert_eq!(Action::RunCommand(cmd.clone()).timeout(), Ok(None));
        cmd.timeout = Some(2.5);
        assert_eq!(
            Action::RunCommand(cmd).timeout(),
            Ok(Some(Duration::from_millis(2500)))
        );
    }

    #[test]
    fn test_timeout_out_of_range_is_rejected() {
        let cell = |timeout| {
            Action::RunCodeCell(RunCodeCell {
                code: "1".into(),
                timeout: Some(timeout),
            })
        };
        assert_eq!(cell(1e20).timeout(), Err(InvalidTimeout(1e20)));
        assert!(cell(f64::INFINITY).timeout().is_err());
        assert!(cell(f64::NAN).timeout().is_err());
        assert_eq!(
            Action::ReadFile(ReadFile::whole("a.txt")).timeout(),
            Ok(None)
        );
    }

    #[test]
    fn test_error_observation_shape() {
        let obs = Observation::error(ErrorKind::LintRegression, "rolled back");
        let value = serde_json::to_value(&obs).unwrap();
        assert_eq!(
            value,
            json!({"observation": "error", "kind": "lint_regression", "message": "rolled back"})
        );
        assert!(!obs.is_session_fatal());
        assert!(Observation::error(ErrorKind::Process, "bash exited").is_session_fatal());
    }

    #[test]
    fn test_request_envelopes() {
        let request = ApiError::decode_request(
            r#"{"id": 7, "action": {"action": "run_code_cell", "code": "print(1)"}}"#,
        )
        .unwrap();
        assert_eq!(request.id(), 7);

        let query = ApiError::decode_request(r#"{"id": 8, "query": "server_info"}"#).unwrap();
        assert_eq!(
            query,
            Request::Query {
                id: 8,
                query: Query::ServerInfo
            }
        );
    }

    #[test]
    fn test_malformed_request_keeps_id() {
        let (id, err) =
            ApiError::decode_request(r#"{"id": 9, "action": {"action": "teleport"}}"#).unwrap_err();
        assert_eq!(id, Some(9));
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(
            err.into_observation().error_kind(),
            Some(ErrorKind::Transport)
        );

        let (id, _) = ApiError::decode_request("not json").unwrap_err();
        assert_eq!(id, None);
    }
}
