//! Sentinel-driven request/response protocol over one interactive shell.

use crate::sentinel::{PromptSentinel, SentinelMatch};
use crate::splitter::{escape_special_chars, split_commands};
use crate::terminal::{PtyTerminal, Terminal};
use crate::{CommandRequest, ShellBackend, ShellConfig, ShellError};
use agent_api_types::{CommandMetadata, CommandOutput, CommandStatus, ErrorKind, Observation};
use sandbox_common::redact_command;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CONTINUATION_PREFIX: &str = "[Below is the output of the previous command.]\n";

/// Unreported output kept while waiting for a prompt; older bytes are dropped.
const MAX_PENDING_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Executing,
    Completed,
    NoChangeTimeout,
    HardTimeout,
    Dead,
}

impl SessionState {
    /// A command was started and its prompt has not been seen yet.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SessionState::NoChangeTimeout | SessionState::HardTimeout
        )
    }
}

#[derive(Debug, Clone)]
struct RunningCommand {
    command: String,
    started: Instant,
}

#[derive(Debug, Clone)]
struct LastCommand {
    key: String,
    exit_code: i32,
}

/// How the poll loop stopped.
enum PollOutcome {
    Prompt(SentinelMatch),
    Timeout(CommandStatus),
}

pub struct ShellSession<T: Terminal> {
    terminal: T,
    sentinel: PromptSentinel,
    config: ShellConfig,
    state: SessionState,
    cwd: PathBuf,
    pending: Vec<u8>,
    consumed: usize,
    running: Option<RunningCommand>,
    last_command: Option<LastCommand>,
}

impl ShellSession<PtyTerminal> {
    /// Spawn the configured shell in a PTY and wait for its first prompt.
    pub fn spawn(config: ShellConfig) -> Result<Self, ShellError> {
        let terminal =
            PtyTerminal::spawn(&config).map_err(|err| ShellError::Spawn(format!("{err:#}")))?;
        Self::start(terminal, PromptSentinel::new(), config)
    }
}

impl<T: Terminal> ShellSession<T> {
    /// Install the sentinel prompt on `terminal`, then run the configured init commands.
    pub fn start(
        terminal: T,
        sentinel: PromptSentinel,
        config: ShellConfig,
    ) -> Result<Self, ShellError> {
        let cwd = config.work_dir.clone();
        let mut session = Self {
            terminal,
            sentinel,
            config,
            state: SessionState::Uninitialized,
            cwd,
            pending: Vec::new(),
            consumed: 0,
            running: None,
            last_command: None,
        };
        session.bootstrap()?;
        let init_commands = session.config.init_commands.clone();
        for command in init_commands {
            session.run_init_command(&command)?;
        }
        Ok(session)
    }

    fn bootstrap(&mut self) -> Result<(), ShellError> {
        let bootstrap = self.sentinel.bootstrap_command();
        self.write(bootstrap.as_bytes())?;
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            self.terminal.read_available(&mut self.pending);
            if let Some(found) = self.sentinel.find(&self.pending) {
                self.pending.drain(..found.end);
                self.cwd = PathBuf::from(&found.fields.working_dir);
                self.state = SessionState::Ready;
                info!(
                    pid = ?self.terminal.pid(),
                    cwd = %self.cwd.display(),
                    "shell session ready"
                );
                return Ok(());
            }
            self.ensure_process_alive()?;
            if Instant::now() >= deadline {
                return Err(ShellError::StartupTimeout(self.config.startup_timeout));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn run_init_command(&mut self, command: &str) -> Result<(), ShellError> {
        let request = CommandRequest {
            command: command.to_string(),
            is_input: false,
            hard_timeout: Some(self.config.startup_timeout),
            blocking: true,
        };
        match self.execute(&request)? {
            Observation::CommandOutput(out) if out.exit_code == 0 => Ok(()),
            Observation::CommandOutput(out) => Err(ShellError::InitCommand {
                command: command.to_string(),
                exit_code: out.exit_code,
                output: out.content,
            }),
            other => Err(ShellError::InitCommand {
                command: command.to_string(),
                exit_code: -1,
                output: other.content().to_string(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn execute(&mut self, request: &CommandRequest) -> Result<Observation, ShellError> {
        self.ensure_process_alive()?;

        let command = if request.is_input {
            request.command.clone()
        } else {
            request.command.trim().to_string()
        };

        if self.state.is_pending() {
            return self.continue_pending(&command, request);
        }

        if command.is_empty() {
            return Ok(Observation::error(
                ErrorKind::Validation,
                "ERROR: No previous running command to retrieve logs from.",
            ));
        }
        if request.is_input {
            return Ok(Observation::error(
                ErrorKind::Validation,
                "ERROR: No previous running command to interact with.",
            ));
        }
        if let Some(observation) = self.already_in_directory(&command) {
            return Ok(observation);
        }

        let statements = split_commands(&command);
        debug!(
            command = %redact_command(&command),
            statements = statements.len(),
            "executing shell command"
        );

        // Output read after the last prompt belongs to no one.
        if !self.pending.is_empty() {
            debug!(bytes = self.pending.len(), "discarding stray shell output");
            self.pending.clear();
        }
        self.consumed = 0;

        self.write(wire_command(&command).as_bytes())?;
        self.running = Some(RunningCommand {
            command,
            started: Instant::now(),
        });
        self.state = SessionState::Executing;
        self.await_prompt(request, "")
    }

    fn continue_pending(
        &mut self,
        command: &str,
        request: &CommandRequest,
    ) -> Result<Observation, ShellError> {
        if request.is_input {
            let bytes = crate::keys::encode_input(command);
            debug!(input = %redact_command(command), "sending input to running command");
            self.write(&bytes)?;
            self.state = SessionState::Executing;
            return self.await_prompt(request, CONTINUATION_PREFIX);
        }
        if command.is_empty() {
            self.state = SessionState::Executing;
            return self.await_prompt(request, CONTINUATION_PREFIX);
        }

        self.terminal.read_available(&mut self.pending);
        if let Some(found) = self.sentinel.find(&self.pending[self.consumed..]) {
            // The previous command finished since the last poll; report it instead.
            let observation = self.complete(found, CONTINUATION_PREFIX);
            return Ok(observation);
        }
        let output = self.take_partial_output();
        let running = self.running_command();
        let suffix = format!(
            "\n[Your command \"{command}\" is NOT executed. The previous command \"{running}\" is still running. \
             You CANNOT send new commands until the previous command is completed. By setting `is_input` to `true`, \
             you can interact with the current process: send an empty command to wait for more output, send text \
             to answer a prompt, or send keys (\"C-c\", \"C-z\", \"C-d\") to interrupt the previous command.]"
        );
        Ok(self.observation(
            command,
            output,
            -1,
            CommandStatus::NotExecuted,
            String::new(),
            suffix,
            None,
        ))
    }

    fn await_prompt(
        &mut self,
        request: &CommandRequest,
        prefix: &str,
    ) -> Result<Observation, ShellError> {
        let hard_timeout = request
            .hard_timeout
            .unwrap_or(self.config.default_hard_timeout);
        match self.poll(hard_timeout, request.blocking)? {
            PollOutcome::Prompt(found) => Ok(self.complete(found, prefix)),
            PollOutcome::Timeout(status) => {
                let timeout = match status {
                    CommandStatus::HardTimeout => hard_timeout,
                    _ => self.config.no_change_timeout,
                };
                Ok(self.timed_out(status, timeout, prefix))
            }
        }
    }

    /// Accumulate output until the sentinel or a timeout. Searches the whole
    /// unconsumed buffer on every round so a prompt split across reads still matches.
    /// The hard timeout always applies; `blocking` only lifts the no-change timeout.
    fn poll(&mut self, hard_timeout: Duration, blocking: bool) -> Result<PollOutcome, ShellError> {
        let started = Instant::now();
        let mut last_change = started;
        loop {
            let received = self.terminal.read_available(&mut self.pending);
            if let Some(found) = self.sentinel.find(&self.pending[self.consumed..]) {
                return Ok(PollOutcome::Prompt(found));
            }
            if received > 0 {
                last_change = Instant::now();
                self.trim_pending();
            }
            self.ensure_process_alive()?;
            if !blocking && last_change.elapsed() >= self.config.no_change_timeout {
                return Ok(PollOutcome::Timeout(CommandStatus::NoChangeTimeout));
            }
            if started.elapsed() >= hard_timeout {
                return Ok(PollOutcome::Timeout(CommandStatus::HardTimeout));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Keep at most [`MAX_PENDING_BYTES`] of unreported output, cut on a
    /// character boundary. A prompt block is far shorter than the cap.
    fn trim_pending(&mut self) {
        if self.pending.len() <= MAX_PENDING_BYTES {
            return;
        }
        let mut cut = self
            .consumed
            .max(self.pending.len() - MAX_PENDING_BYTES);
        while cut < self.pending.len() && self.pending[cut] & 0xC0 == 0x80 {
            cut += 1;
        }
        self.pending.drain(..cut);
        self.consumed = 0;
        debug!(dropped = cut, "shell output over buffer limit");
    }

    fn complete(&mut self, found: SentinelMatch, prefix: &str) -> Observation {
        let start = self.consumed + found.start;
        let end = self.consumed + found.end;
        let command = self.running_command();
        let raw = String::from_utf8_lossy(&self.pending[self.consumed..start]).into_owned();
        let output = normalize_output(&raw, &command);
        self.pending.drain(..end);
        self.consumed = 0;
        self.state = SessionState::Completed;

        let fields = found.fields;
        if !fields.working_dir.is_empty() {
            self.cwd = PathBuf::from(&fields.working_dir);
        }
        let exit_code = fields.exit_code;

        let mut suffix = String::new();
        if !prefix.is_empty() {
            suffix.push_str(&format!(
                "\n[The command completed with exit code {exit_code}.]"
            ));
        }
        let key = escape_special_chars(&command);
        if let Some(last) = &self.last_command {
            if exit_code != 0 && last.exit_code != 0 && last.key == key {
                suffix.push_str(&format!(
                    "\n[This command failed the same way as the previous attempt (exit code {exit_code}). \
                     Repeating it will not help; change the approach.]"
                ));
            }
        }
        self.last_command = Some(LastCommand { key, exit_code });

        let duration = self.running.as_ref().map(|r| r.started.elapsed());
        self.running = None;
        debug!(
            exit_code,
            cwd = %self.cwd.display(),
            duration_ms = duration.map(|d| d.as_millis() as u64).unwrap_or_default(),
            "shell command completed"
        );

        let mut observation = self.observation(
            &command,
            output,
            exit_code,
            CommandStatus::Completed,
            prefix.to_string(),
            suffix,
            duration,
        );
        if let Observation::CommandOutput(out) = &mut observation {
            out.metadata.prompt_found = true;
            out.metadata.pid = fields.pid;
            out.metadata.username = fields.username;
            out.metadata.hostname = fields.hostname;
        }
        self.state = SessionState::Ready;
        observation
    }

    fn timed_out(&mut self, status: CommandStatus, after: Duration, prefix: &str) -> Observation {
        let output = self.take_partial_output();
        let command = self.running_command();
        self.state = match status {
            CommandStatus::HardTimeout => SessionState::HardTimeout,
            _ => SessionState::NoChangeTimeout,
        };
        let secs = after.as_secs_f64();
        let suffix = match status {
            CommandStatus::HardTimeout => format!(
                "\n[The command timed out after {secs} seconds. You may wait longer to see additional output by \
                 sending an empty command, send other input to interact with the current process, or send keys \
                 (\"C-c\", \"C-z\", \"C-d\") to interrupt it.]"
            ),
            _ => format!(
                "\n[The command has no new output after {secs} seconds. You may wait longer to see additional \
                 output by sending an empty command, send other input to interact with the current process, or \
                 send keys (\"C-c\", \"C-z\", \"C-d\") to interrupt it.]"
            ),
        };
        warn!(
            status = status.as_str(),
            command = %redact_command(&command),
            "shell command did not finish"
        );
        let duration = self.running.as_ref().map(|r| r.started.elapsed());
        self.observation(
            &command,
            output,
            -1,
            status,
            prefix.to_string(),
            suffix,
            duration,
        )
    }

    /// Return unreported output up to the last complete UTF-8 character. Bytes
    /// that may open a prompt block stay buffered for the next poll.
    fn take_partial_output(&mut self) -> String {
        let unread = &self.pending[self.consumed..];
        let mut keep_from = self.sentinel.incomplete_start(unread);
        if keep_from < unread.len() {
            // The newline PS1 prints before its first marker belongs to the prompt.
            if keep_from > 0 && unread[keep_from - 1] == b'\n' {
                keep_from -= 1;
                if keep_from > 0 && unread[keep_from - 1] == b'\r' {
                    keep_from -= 1;
                }
            }
        }
        let unread = &unread[..keep_from];
        let valid = match std::str::from_utf8(unread) {
            Ok(_) => unread.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => unread.len(),
        };
        let text = String::from_utf8_lossy(&unread[..valid]).into_owned();
        self.consumed += valid;
        normalize_output(&text, &self.running_command())
    }

    #[allow(clippy::too_many_arguments)]
    fn observation(
        &self,
        command: &str,
        output: String,
        exit_code: i32,
        status: CommandStatus,
        prefix: String,
        suffix: String,
        duration: Option<Duration>,
    ) -> Observation {
        let content = format!("{prefix}{output}{suffix}");
        Observation::CommandOutput(CommandOutput {
            content,
            command: command.to_string(),
            exit_code,
            metadata: CommandMetadata {
                working_dir: Some(self.cwd.display().to_string()),
                duration_ms: duration.map(|d| d.as_millis() as u64).unwrap_or_default(),
                status,
                prefix,
                suffix,
                ..CommandMetadata::default()
            },
        })
    }

    fn already_in_directory(&self, command: &str) -> Option<Observation> {
        let target = command.strip_prefix("cd ")?.trim();
        if target.is_empty() || target.contains(char::is_whitespace) {
            return None;
        }
        let target = target.trim_matches(|c| c == '"' || c == '\'');
        let resolved = if target == "." {
            self.cwd.clone()
        } else {
            let path = Path::new(target);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.cwd.join(path)
            }
        };
        let same = match (resolved.canonicalize(), self.cwd.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => resolved == self.cwd,
        };
        if !same {
            return None;
        }
        Some(self.observation(
            command,
            "[You are already in this directory.]".to_string(),
            0,
            CommandStatus::NotExecuted,
            String::new(),
            String::new(),
            None,
        ))
    }

    fn running_command(&self) -> String {
        self.running
            .as_ref()
            .map(|r| r.command.clone())
            .unwrap_or_default()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ShellError> {
        if let Err(err) = self.terminal.write_all(bytes) {
            self.ensure_process_alive()?;
            return Err(ShellError::Io(err));
        }
        Ok(())
    }

    fn ensure_process_alive(&mut self) -> Result<(), ShellError> {
        if self.state == SessionState::Dead {
            return Err(ShellError::ProcessExited {
                status: "already exited".to_string(),
                output: String::new(),
            });
        }
        if let Some(status) = self.terminal.exit_status()? {
            self.state = SessionState::Dead;
            let tail = String::from_utf8_lossy(&self.pending[self.consumed..]).into_owned();
            let output = normalize_output(&tail, &self.running_command());
            warn!(status = %status.describe(), "shell process exited");
            return Err(ShellError::ProcessExited {
                status: status.describe(),
                output,
            });
        }
        Ok(())
    }
}

impl<T: Terminal> ShellBackend for ShellSession<T> {
    fn execute(&mut self, request: &CommandRequest) -> Result<Observation, ShellError> {
        ShellSession::execute(self, request)
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn is_alive(&mut self) -> bool {
        self.ensure_process_alive().is_ok()
    }

    fn close(&mut self) {
        self.terminal.terminate();
        self.state = SessionState::Dead;
    }
}

/// Text written to the shell for `command`. Multi-line input runs as one
/// group so bash prints a single prompt after the last line.
fn wire_command(command: &str) -> String {
    if command.contains('\n') {
        format!("{{ {command}\n}}\n")
    } else {
        format!("{command}\n")
    }
}

/// Convert CRLF, drop an echoed copy of the command and the newline the prompt
/// puts in front of its first marker.
fn normalize_output(raw: &str, command: &str) -> String {
    let mut text = raw.replace("\r\n", "\n");
    let first_line = command.lines().next().unwrap_or_default();
    if !first_line.is_empty() {
        if let Some(rest) = text.strip_prefix(first_line) {
            if rest.is_empty() || rest.starts_with('\n') {
                text = rest.strip_prefix('\n').unwrap_or(rest).to_string();
            }
        }
    }
    if text.ends_with('\n') {
        text.pop();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Plays back one scripted chunk per read.
    struct ScriptedTerminal {
        chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
        written: Arc<Mutex<Vec<u8>>>,
        exited: Arc<AtomicBool>,
    }

    #[derive(Clone)]
    struct Script {
        chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
        written: Arc<Mutex<Vec<u8>>>,
        exited: Arc<AtomicBool>,
    }

    impl Script {
        fn new() -> Self {
            Self {
                chunks: Arc::new(Mutex::new(VecDeque::new())),
                written: Arc::new(Mutex::new(Vec::new())),
                exited: Arc::new(AtomicBool::new(false)),
            }
        }

        fn push(&self, chunk: impl Into<Vec<u8>>) {
            self.chunks.lock().unwrap().push_back(chunk.into());
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
        }

        fn terminal(&self) -> ScriptedTerminal {
            ScriptedTerminal {
                chunks: Arc::clone(&self.chunks),
                written: Arc::clone(&self.written),
                exited: Arc::clone(&self.exited),
            }
        }
    }

    impl Terminal for ScriptedTerminal {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn read_available(&mut self, into: &mut Vec<u8>) -> usize {
            match self.chunks.lock().unwrap().pop_front() {
                Some(chunk) => {
                    into.extend_from_slice(&chunk);
                    chunk.len()
                }
                None => 0,
            }
        }

        fn exit_status(&mut self) -> io::Result<Option<crate::PtyExitStatus>> {
            Ok(self.exited.load(Ordering::SeqCst).then_some(crate::PtyExitStatus {
                code: Some(0),
                signal: None,
            }))
        }

        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn terminate(&mut self) {
            self.exited.store(true, Ordering::SeqCst);
        }
    }

    fn test_config() -> ShellConfig {
        ShellConfig {
            work_dir: PathBuf::from("/work"),
            no_change_timeout: Duration::from_millis(150),
            default_hard_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(2),
            startup_timeout: Duration::from_secs(2),
            ..ShellConfig::default()
        }
    }

    fn started(script: &Script) -> (ShellSession<ScriptedTerminal>, PromptSentinel) {
        let sentinel = PromptSentinel::with_id("t35t");
        script.push(format!("bash-5.2$ {}", sentinel.render(0, "/work")));
        let session = ShellSession::start(script.terminal(), sentinel.clone(), test_config())
            .expect("session starts");
        (session, sentinel)
    }

    fn command_output(obs: Observation) -> CommandOutput {
        match obs {
            Observation::CommandOutput(out) => out,
            other => panic!("expected command output, got {other:?}"),
        }
    }

    #[test]
    fn test_startup_sends_bootstrap_and_reaches_ready() {
        let script = Script::new();
        let (session, sentinel) = started(&script);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(script.written().contains(&format!("{}''_BEGIN", sentinel.id())));
        assert_eq!(ShellBackend::cwd(&session), Path::new("/work"));
    }

    #[test]
    fn test_prompt_split_across_reads_completes() {
        let script = Script::new();
        let (mut session, sentinel) = started(&script);
        let prompt = sentinel.render(0, "/work/src");
        let (head, tail) = prompt.split_at(prompt.len() / 2);
        script.push(format!("hello\r\n{head}"));
        script.push(Vec::new());
        script.push(tail.to_string());

        let out = command_output(
            session
                .execute(&CommandRequest::new("cd src && echo hello"))
                .unwrap(),
        );
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.content, "hello\n");
        assert_eq!(out.metadata.status, CommandStatus::Completed);
        assert!(out.metadata.prompt_found);
        assert_eq!(out.metadata.working_dir.as_deref(), Some("/work/src"));
        assert!(script.written().ends_with("cd src && echo hello\n"));
    }

    #[test]
    fn test_no_change_timeout_then_poll_for_rest() {
        let script = Script::new();
        let (mut session, sentinel) = started(&script);
        script.push("step 1\r\n");

        let started_at = Instant::now();
        let out = command_output(session.execute(&CommandRequest::new("./long.sh")).unwrap());
        assert!(started_at.elapsed() < Duration::from_secs(2));
        assert_eq!(out.exit_code, -1);
        assert_eq!(out.metadata.status, CommandStatus::NoChangeTimeout);
        assert!(out.content.starts_with("step 1"));
        assert!(out.content.contains("no new output"));
        assert_eq!(session.state(), SessionState::NoChangeTimeout);

        script.push(format!("step 2\r\n{}", sentinel.render(0, "/work")));
        let out = command_output(session.execute(&CommandRequest::new("")).unwrap());
        assert_eq!(out.exit_code, 0);
        assert!(out.content.starts_with(CONTINUATION_PREFIX));
        assert!(out.content.contains("step 2"));
        assert!(!out.content.contains("step 1"));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_new_command_while_pending_is_not_executed() {
        let script = Script::new();
        let (mut session, _sentinel) = started(&script);
        session.execute(&CommandRequest::new("sleep 100")).unwrap();
        let before = script.written();

        let out = command_output(session.execute(&CommandRequest::new("ls")).unwrap());
        assert_eq!(out.exit_code, -1);
        assert_eq!(out.metadata.status, CommandStatus::NotExecuted);
        assert!(out.content.contains("NOT executed"));
        assert_eq!(script.written(), before);
    }

    #[test]
    fn test_interrupt_input_sends_control_byte() {
        let script = Script::new();
        let (mut session, sentinel) = started(&script);
        session.execute(&CommandRequest::new("sleep 100")).unwrap();
        script.push(sentinel.render(130, "/work"));

        let out = command_output(session.execute(&CommandRequest::input("C-c")).unwrap());
        assert_eq!(out.exit_code, 130);
        assert!(script.written().ends_with('\u{3}'));
    }

    #[test]
    fn test_hard_timeout_applies_while_output_keeps_flowing() {
        let script = Script::new();
        let (mut session, _sentinel) = started(&script);
        for idx in 0..500 {
            script.push(format!("tick {idx}\r\n"));
        }
        let mut request = CommandRequest::new("yes tick");
        request.hard_timeout = Some(Duration::from_millis(100));
        request.blocking = true;
        let out = command_output(session.execute(&request).unwrap());
        assert_eq!(out.metadata.status, CommandStatus::HardTimeout);
        assert_eq!(session.state(), SessionState::HardTimeout);
    }

    #[test]
    fn test_hard_timeout_applies_by_default_even_when_blocking() {
        let script = Script::new();
        let sentinel = PromptSentinel::with_id("t35t");
        script.push(sentinel.render(0, "/work"));
        let mut config = test_config();
        config.default_hard_timeout = Duration::from_millis(200);
        let mut session = ShellSession::start(script.terminal(), sentinel, config).unwrap();
        for _ in 0..5000 {
            script.push("y\r\n");
        }

        let started_at = Instant::now();
        let mut request = CommandRequest::new("yes");
        request.blocking = true;
        let out = command_output(session.execute(&request).unwrap());
        assert!(started_at.elapsed() < Duration::from_secs(3));
        assert_eq!(out.metadata.status, CommandStatus::HardTimeout);
        assert_eq!(out.exit_code, -1);
        assert!(out.content.contains("timed out after 0.2 seconds"));
    }

    #[test]
    fn test_flooding_output_is_capped() {
        let script = Script::new();
        let (mut session, _sentinel) = started(&script);
        for _ in 0..8 {
            script.push(vec![b'a'; 256 * 1024]);
        }
        script.push("tail-end\r\n");

        let mut request = CommandRequest::new("cat /dev/urandom");
        request.hard_timeout = Some(Duration::from_millis(300));
        request.blocking = true;
        let out = command_output(session.execute(&request).unwrap());
        assert_eq!(out.metadata.status, CommandStatus::HardTimeout);
        assert!(session.pending.len() <= MAX_PENDING_BYTES);
        let output = out.content.split("\n[The command timed out").next().unwrap();
        assert!(output.len() <= MAX_PENDING_BYTES);
        assert!(output.ends_with("tail-end"));
    }

    #[test]
    fn test_prompt_split_at_timeout_completes_on_next_poll() {
        let reference_prompt = PromptSentinel::with_id("t35t").render(0, "/work");
        let marker_at = reference_prompt.find("###").unwrap();
        for cut in [marker_at + 5, reference_prompt.len() / 2] {
            let script = Script::new();
            let (mut session, sentinel) = started(&script);
            let prompt = sentinel.render(0, "/work");
            let (head, tail) = prompt.split_at(cut);
            script.push(format!("partial\r\n{head}"));

            let mut request = CommandRequest::new("./slow.sh");
            request.hard_timeout = Some(Duration::from_millis(50));
            request.blocking = true;
            let out = command_output(session.execute(&request).unwrap());
            assert_eq!(out.metadata.status, CommandStatus::HardTimeout, "cut={cut}");
            assert!(out.content.starts_with("partial"));
            assert!(!out.content.contains("SANDBOX_PS1"), "cut={cut}");

            script.push(tail.to_string());
            let out = command_output(session.execute(&CommandRequest::new("")).unwrap());
            assert_eq!(out.metadata.status, CommandStatus::Completed, "cut={cut}");
            assert_eq!(out.exit_code, 0);
            assert!(!out.content.contains("SANDBOX_PS1"));
            assert!(!out.content.contains("partial"));
            assert_eq!(session.state(), SessionState::Ready);
        }
    }

    #[test]
    fn test_multiline_command_runs_as_one_group() {
        let script = Script::new();
        let (mut session, sentinel) = started(&script);
        script.push(format!("first\r\nsecond\r\n{}", sentinel.render(0, "/work")));

        let command = "cat <<'EOF' > f.txt\nfirst\nsecond\nEOF\ncat f.txt";
        let out = command_output(session.execute(&CommandRequest::new(command)).unwrap());
        assert_eq!(out.content, "first\nsecond\n");
        assert_eq!(out.command, command);
        assert!(script.written().ends_with(&format!("{{ {command}\n}}\n")));
    }

    #[test]
    fn test_wire_command_only_groups_multiline_input() {
        assert_eq!(wire_command("ls -la"), "ls -la\n");
        assert_eq!(wire_command("a\nb"), "{ a\nb\n}\n");
    }

    #[test]
    fn test_validation_errors_without_running_command() {
        let script = Script::new();
        let (mut session, _sentinel) = started(&script);
        let empty = session.execute(&CommandRequest::new("   ")).unwrap();
        assert_eq!(empty.error_kind(), Some(ErrorKind::Validation));
        let input = session.execute(&CommandRequest::input("y")).unwrap();
        assert_eq!(input.error_kind(), Some(ErrorKind::Validation));
    }

    #[test]
    fn test_cd_into_current_directory_is_short_circuited() {
        let script = Script::new();
        let (mut session, _sentinel) = started(&script);
        let before = script.written();
        let out = command_output(session.execute(&CommandRequest::new("cd /work")).unwrap());
        assert_eq!(out.content, "[You are already in this directory.]");
        assert_eq!(out.exit_code, 0);
        assert_eq!(script.written(), before);
    }

    #[test]
    fn test_repeated_failure_gets_hint() {
        let script = Script::new();
        let (mut session, sentinel) = started(&script);
        script.push(format!("boom\r\n{}", sentinel.render(2, "/work")));
        let first = command_output(session.execute(&CommandRequest::new("make")).unwrap());
        assert!(!first.metadata.suffix.contains("same way"));

        script.push(format!("boom\r\n{}", sentinel.render(2, "/work")));
        let second = command_output(session.execute(&CommandRequest::new("make")).unwrap());
        assert!(second.metadata.suffix.contains("same way"));
    }

    #[test]
    fn test_process_death_is_fatal() {
        let script = Script::new();
        let (mut session, _sentinel) = started(&script);
        script.exited.store(true, Ordering::SeqCst);
        let err = session.execute(&CommandRequest::new("echo hi")).unwrap_err();
        assert!(matches!(err, ShellError::ProcessExited { .. }));
        assert_eq!(session.state(), SessionState::Dead);
        assert!(session.execute(&CommandRequest::new("echo hi")).is_err());
    }

    #[test]
    fn test_startup_timeout_without_prompt() {
        let script = Script::new();
        let mut config = test_config();
        config.startup_timeout = Duration::from_millis(30);
        let result = ShellSession::start(
            script.terminal(),
            PromptSentinel::with_id("never"),
            config,
        );
        assert!(matches!(result, Err(ShellError::StartupTimeout(_))));
    }

    #[test]
    fn test_normalize_output_strips_echo_and_crlf() {
        assert_eq!(normalize_output("ls\r\na\r\nb\r\n", "ls"), "a\nb");
        assert_eq!(normalize_output("lsof\r\n", "ls"), "lsof");
        assert_eq!(normalize_output("", "ls"), "");
    }
}
