use crate::files::FileOpError;
use crate::plugins::PluginError;
use agent_api_types::{ErrorKind, Observation};
use sandbox_shell::ShellError;

/// Everything a handler can fail with. Each variant maps onto one
/// [`ErrorKind`] and leaves the dispatcher as an error observation.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Policy(String),
    #[error(transparent)]
    File(#[from] FileOpError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Validation(_) | RuntimeError::Policy(_) => ErrorKind::Validation,
            RuntimeError::File(err) => err.kind(),
            RuntimeError::Plugin(err) => err.kind(),
            RuntimeError::Shell(_) => ErrorKind::Process,
            RuntimeError::Worker(_) => ErrorKind::Transport,
        }
    }

    pub fn into_observation(self) -> Observation {
        Observation::error(self.kind(), self.to_string())
    }
}

impl From<tokio::task::JoinError> for RuntimeError {
    fn from(err: tokio::task::JoinError) -> Self {
        RuntimeError::Worker(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kinds() {
        let shell = RuntimeError::from(ShellError::ProcessExited {
            status: "exit code 1".into(),
            output: String::new(),
        });
        assert_eq!(shell.kind(), ErrorKind::Process);
        assert!(shell.into_observation().is_session_fatal());

        let timeout = RuntimeError::from(PluginError::CellTimeout(Duration::from_secs(3)));
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let file = RuntimeError::from(FileOpError::NotUtf8("/w/a.bin".into()));
        assert_eq!(file.kind(), ErrorKind::Encoding);

        let policy = RuntimeError::Policy("denied".into()).into_observation();
        assert_eq!(policy.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(policy.content(), "denied");
    }
}
