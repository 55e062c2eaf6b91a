//! Byte-stream transport under the shell session.

use crate::ShellConfig;
use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Exit status of the process behind a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl PtyExitStatus {
    pub(crate) fn from_portable_pty(status: portable_pty::ExitStatus) -> Self {
        let raw = status.exit_code() as i32;
        if cfg!(unix) && raw > 128 {
            PtyExitStatus {
                code: None,
                signal: Some(raw - 128),
            }
        } else {
            PtyExitStatus {
                code: Some(raw),
                signal: None,
            }
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Raw interactive stream the session drives. Implementations must never block
/// in [`Terminal::read_available`].
pub trait Terminal: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Append every byte received since the last call to `into`; returns the count.
    fn read_available(&mut self, into: &mut Vec<u8>) -> usize;

    /// `Some` once the process behind the terminal has exited.
    fn exit_status(&mut self) -> io::Result<Option<PtyExitStatus>>;

    fn pid(&self) -> Option<u32>;

    fn terminate(&mut self);
}

/// Interactive shell attached to a pseudo terminal, read by a background thread.
pub struct PtyTerminal {
    _master: Box<dyn portable_pty::MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    chunks: Receiver<Vec<u8>>,
    reader_closed: bool,
}

impl PtyTerminal {
    pub fn spawn(config: &ShellConfig) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 50,
                cols: 160,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&config.program);
        cmd.args(&config.args);
        cmd.cwd(&config.work_dir);
        cmd.env("TERM", "xterm-256color");
        let inherited_path = std::env::var("PATH").unwrap_or_default();
        cmd.env(
            "PATH",
            sandbox_common::prepend_path(&config.extra_path, &inherited_path),
        );
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", config.program))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, chunks) = mpsc::channel();
        thread::Builder::new()
            .name("shell-pty-reader".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; 8192];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buffer[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::debug!(error = %e, "pty reader stopped");
                            break;
                        }
                    }
                }
            })
            .context("failed to start pty reader thread")?;

        tracing::info!(
            program = %config.program,
            pid = ?child.process_id(),
            work_dir = %config.work_dir.display(),
            "spawned shell"
        );

        Ok(Self {
            _master: pair.master,
            writer,
            child,
            chunks,
            reader_closed: false,
        })
    }
}

impl Terminal for PtyTerminal {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn read_available(&mut self, into: &mut Vec<u8>) -> usize {
        let mut total = 0;
        while !self.reader_closed {
            match self.chunks.try_recv() {
                Ok(chunk) => {
                    total += chunk.len();
                    into.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.reader_closed = true,
            }
        }
        total
    }

    fn exit_status(&mut self) -> io::Result<Option<PtyExitStatus>> {
        Ok(self
            .child
            .try_wait()?
            .map(PtyExitStatus::from_portable_pty))
    }

    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn terminate(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                tracing::warn!(error = %e, "failed to kill shell process");
            }
            let _ = self.child.wait();
        }
    }
}

impl Drop for PtyTerminal {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_description() {
        let exited = PtyExitStatus {
            code: Some(3),
            signal: None,
        };
        assert_eq!(exited.describe(), "exit code 3");
        let killed = PtyExitStatus {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.describe(), "signal 9");
    }

    #[cfg(unix)]
    #[test]
    fn test_from_portable_pty_splits_signals() {
        let status = PtyExitStatus::from_portable_pty(portable_pty::ExitStatus::with_exit_code(137));
        assert_eq!(status.signal, Some(9));
        let status = PtyExitStatus::from_portable_pty(portable_pty::ExitStatus::with_exit_code(1));
        assert_eq!(status.code, Some(1));
    }
}
