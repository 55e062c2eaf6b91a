//! Persistent Python interpreter driven over JSON lines.
//!
//! The driver script keeps one namespace for the life of the process. Each
//! request is one JSON object on stdin; each reply is one line on stdout that
//! starts with [`RESPONSE_PREFIX`]. Anything else the process prints is kept
//! and prepended to the next reply.

use super::kernel_output::{self, KernelReply};
use super::{Plugin, PluginContext, PluginError};
use crate::config::{PluginName, RuntimeConfig};
use agent_api_types::Observation;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

pub const RESPONSE_PREFIX: &str = "__SANDBOX_KERNEL__ ";

const DRIVER: &str = r##"
import ast, base64, contextlib, io, json, os, subprocess, sys, traceback

_PREFIX = "__SANDBOX_KERNEL__ "
_proto = sys.stdout
_images = []
_ns = {"__name__": "__main__"}


def display_image(data, fmt="png"):
    if isinstance(data, (bytes, bytearray)):
        data = base64.b64encode(bytes(data)).decode("ascii")
    _images.append("data:image/%s;base64,%s" % (fmt, data))


def _sandbox_shell(cmd):
    cmd = cmd.strip()
    if cmd == "pip" or cmd.startswith("pip "):
        cmd = '"%s" -m %s' % (sys.executable, cmd)
    proc = subprocess.run(cmd, shell=True, stdout=subprocess.PIPE,
                          stderr=subprocess.STDOUT, text=True)
    sys.stdout.write(proc.stdout)


_ns["display_image"] = display_image
_ns["_sandbox_shell"] = _sandbox_shell


def _rewrite(code):
    lines = code.splitlines()
    if lines and lines[0].lstrip().startswith("%%writefile"):
        args = lines[0].split()[1:]
        mode = "a" if "-a" in args else "w"
        target = ([a for a in args if a != "-a"] or [""])[0]
        body = "\n".join(lines[1:]) + "\n"
        verb = "Appending to" if mode == "a" else "Writing"
        return "with open(%r, %r) as _fh:\n    _fh.write(%r)\nprint(%r)" % (
            target, mode, body, "%s %s" % (verb, target))
    out = []
    for line in lines:
        stripped = line.lstrip()
        indent = line[: len(line) - len(stripped)]
        if stripped.startswith("%pip"):
            stripped = "!" + stripped[1:]
        if stripped.startswith("!"):
            out.append("%s_sandbox_shell(%r)" % (indent, stripped[1:]))
        else:
            out.append(line)
    return "\n".join(out)


def _run(code):
    buf = io.StringIO()
    failed = False
    with contextlib.redirect_stdout(buf), contextlib.redirect_stderr(buf):
        try:
            tree = ast.parse(_rewrite(code), "<cell>", "exec")
            tail = None
            if tree.body and isinstance(tree.body[-1], ast.Expr):
                tail = ast.Expression(tree.body.pop().value)
            exec(compile(tree, "<cell>", "exec"), _ns)
            if tail is not None:
                value = eval(compile(tail, "<cell>", "eval"), _ns)
                if value is not None:
                    print(repr(value))
        except BaseException:
            failed = True
            traceback.print_exc()
    return buf.getvalue(), failed


def _reply(output, failed):
    body = {"output": output, "images": list(_images), "error": failed}
    _proto.write(_PREFIX + json.dumps(body) + "\n")
    _proto.flush()


while True:
    _raw = sys.stdin.readline()
    if not _raw:
        break
    try:
        _req = json.loads(_raw)
    except ValueError:
        continue
    _images.clear()
    if _req.get("op") == "chdir":
        try:
            os.chdir(_req["path"])
            _reply("", False)
        except OSError as exc:
            _reply(str(exc), True)
    else:
        _reply(*_run(_req.get("code", "")))
"##;

struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl KernelProcess {
    async fn exchange(&mut self, request: &serde_json::Value) -> Result<KernelReply, PluginError> {
        let mut line =
            serde_json::to_string(request).map_err(|err| PluginError::Protocol(err.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| PluginError::KernelUnavailable(err.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| PluginError::KernelUnavailable(err.to_string()))?;

        let mut stray = String::new();
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|err| PluginError::KernelUnavailable(err.to_string()))?
                .ok_or_else(|| PluginError::KernelUnavailable("kernel process exited".into()))?;
            let Some(body) = line.strip_prefix(RESPONSE_PREFIX) else {
                stray.push_str(&line);
                stray.push('\n');
                continue;
            };
            let mut reply: KernelReply = serde_json::from_str(body)
                .map_err(|err| PluginError::Protocol(err.to_string()))?;
            if !stray.is_empty() {
                stray.push_str(&reply.output);
                reply.output = stray;
            }
            return Ok(reply);
        }
    }
}

pub struct PythonKernel {
    python: String,
    init_code: Option<String>,
    cell_timeout: Duration,
    reject_repeated_failures: bool,
    work_dir: PathBuf,
    process: Option<KernelProcess>,
    /// Directory the kernel was last moved to.
    kernel_cwd: Option<PathBuf>,
    last_code: Option<String>,
    last_failed: bool,
}

impl PythonKernel {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            init_code: None,
            cell_timeout: Duration::from_secs(120),
            reject_repeated_failures: true,
            work_dir: std::env::temp_dir(),
            process: None,
            kernel_cwd: None,
            last_code: None,
            last_failed: false,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            init_code: config.kernel.init_code.clone(),
            cell_timeout: Duration::from_secs(config.kernel.cell_timeout_secs),
            reject_repeated_failures: config.kernel.reject_repeated_failures,
            work_dir: config.work_dir(),
            ..Self::new(config.kernel.python.clone())
        }
    }

    pub fn with_cell_timeout(mut self, timeout: Duration) -> Self {
        self.cell_timeout = timeout;
        self
    }

    pub fn with_init_code(mut self, code: impl Into<String>) -> Self {
        self.init_code = Some(code.into());
        self
    }

    pub fn is_running(&mut self) -> bool {
        self.process
            .as_mut()
            .is_some_and(|process| matches!(process.child.try_wait(), Ok(None)))
    }

    async fn spawn(&mut self) -> Result<(), PluginError> {
        let mut child = Command::new(&self.python)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .current_dir(&self.work_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PluginError::Start {
                name: PluginName::Kernel,
                reason: format!("{}: {err}", self.python),
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PluginError::Start {
                name: PluginName::Kernel,
                reason: "kernel stdio was not captured".into(),
            });
        };
        info!(pid = child.id(), "kernel started");
        self.process = Some(KernelProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });
        self.kernel_cwd = Some(self.work_dir.clone());

        if let Some(code) = self.init_code.clone() {
            let reply = self.request(&json!({"op": "exec", "code": code})).await?;
            if reply.error {
                warn!(output = %reply.output.trim_end(), "kernel init code failed");
            }
        }
        Ok(())
    }

    async fn ensure_running(&mut self) -> Result<(), PluginError> {
        if self.is_running() {
            return Ok(());
        }
        if self.process.take().is_some() {
            warn!("kernel exited; restarting");
        }
        self.spawn().await
    }

    async fn request(&mut self, request: &serde_json::Value) -> Result<KernelReply, PluginError> {
        let Some(process) = self.process.as_mut() else {
            return Err(PluginError::KernelUnavailable("kernel is not started".into()));
        };
        let result = process.exchange(request).await;
        if let Err(PluginError::KernelUnavailable(_)) = &result {
            self.process = None;
            self.kernel_cwd = None;
        }
        result
    }

    async fn sync_cwd(&mut self, cwd: &Path) -> Result<(), PluginError> {
        if self.kernel_cwd.as_deref() == Some(cwd) {
            return Ok(());
        }
        let reply = self
            .request(&json!({"op": "chdir", "path": cwd.display().to_string()}))
            .await?;
        if reply.error {
            debug!(cwd = %cwd.display(), output = %reply.output, "kernel chdir failed");
        } else {
            self.kernel_cwd = Some(cwd.to_path_buf());
        }
        Ok(())
    }

    async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.child.kill().await {
                debug!(error = %err, "kernel kill failed");
            }
        }
        self.kernel_cwd = None;
    }

    /// Run one cell in the shell's current directory.
    pub async fn run_cell(
        &mut self,
        code: &str,
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<Observation, PluginError> {
        if self.reject_repeated_failures
            && self.last_failed
            && self.last_code.as_deref() == Some(code)
        {
            return Err(PluginError::RepeatedFailure);
        }

        self.ensure_running().await?;
        self.sync_cwd(cwd).await?;

        let limit = timeout.unwrap_or(self.cell_timeout);
        let request = json!({"op": "exec", "code": code});
        let reply = match tokio::time::timeout(limit, self.request(&request)).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "kernel cell timed out");
                self.kill().await;
                self.last_code = Some(code.to_string());
                self.last_failed = true;
                return Err(PluginError::CellTimeout(limit));
            }
        };

        self.last_code = Some(code.to_string());
        self.last_failed = reply.error;
        Ok(kernel_output::to_observation(code, reply))
    }
}

#[async_trait]
impl Plugin for PythonKernel {
    fn name(&self) -> PluginName {
        PluginName::Kernel
    }

    async fn initialize(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.work_dir = ctx.work_dir.clone();
        self.spawn().await?;
        let reply = self
            .request(&json!({"op": "exec", "code": "None"}))
            .await
            .map_err(|err| PluginError::Start {
                name: PluginName::Kernel,
                reason: err.to_string(),
            })?;
        if reply.error {
            return Err(PluginError::Start {
                name: PluginName::Kernel,
                reason: reply.output,
            });
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_interpreter_fails_to_start() {
        let mut kernel = PythonKernel::new("definitely-not-python-4711");
        let ctx = PluginContext {
            work_dir: std::env::temp_dir(),
            username: None,
        };
        let err = kernel.initialize(&ctx).await.unwrap_err();
        assert!(matches!(err, PluginError::Start { .. }));
        assert!(!kernel.is_running());
    }

    #[tokio::test]
    async fn test_request_without_process() {
        let mut kernel = PythonKernel::new("python3");
        let err = kernel
            .request(&json!({"op": "exec", "code": "1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::KernelUnavailable(_)));
    }
}
