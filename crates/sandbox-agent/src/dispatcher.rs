//! Serializes actions onto the runtime and normalizes what comes back.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::files::FileOperations;
use crate::handlers;
use crate::monitor::{MonitorHandle, ResourceMonitor};
use crate::plugins::{PluginContext, PluginRegistry};
use crate::policy::ActionPolicy;
use agent_api_types::{Action, ErrorKind, Observation};
use anyhow::{Context, Result};
use sandbox_common::log_schema;
use sandbox_common::text::{strip_ansi, truncate_middle};
use sandbox_common::redact_command;
use sandbox_shell::{ShellBackend, ShellSession};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const SESSION_ENDED_MSG: &str =
    "The shell session has ended and the runtime must be restarted.";

/// Everything an action may touch. Only reachable through the dispatcher lock.
pub struct RuntimeState {
    pub(crate) shell: Arc<Mutex<Box<dyn ShellBackend>>>,
    /// Last directory reported by the shell prompt.
    pub(crate) cwd: PathBuf,
    pub(crate) files: Arc<Mutex<FileOperations>>,
    pub(crate) plugins: PluginRegistry,
    pub(crate) policy: ActionPolicy,
}

impl RuntimeState {
    pub fn new(
        shell: Box<dyn ShellBackend>,
        files: FileOperations,
        plugins: PluginRegistry,
        policy: ActionPolicy,
    ) -> Self {
        let cwd = shell.cwd().to_path_buf();
        Self {
            shell: Arc::new(Mutex::new(shell)),
            cwd,
            files: Arc::new(Mutex::new(files)),
            plugins,
            policy,
        }
    }
}

/// Facts fixed at startup, readable without waiting for the lock.
#[derive(Debug, Clone, Default)]
struct StartupInfo {
    plugins: Vec<String>,
    editor: Option<(u16, String)>,
}

pub struct ActionDispatcher {
    state: tokio::sync::Mutex<RuntimeState>,
    max_output_chars: usize,
    started: Instant,
    last_action: Mutex<Instant>,
    handled: AtomicU64,
    fatal: AtomicBool,
    info: StartupInfo,
    monitor: Option<MonitorHandle>,
}

impl ActionDispatcher {
    pub fn new(state: RuntimeState, max_output_chars: usize) -> Self {
        let info = StartupInfo {
            plugins: state
                .plugins
                .names()
                .iter()
                .map(|name| name.as_str().to_string())
                .collect(),
            editor: state
                .plugins
                .editor()
                .map(|editor| (editor.port(), editor.token().to_string())),
        };
        let now = Instant::now();
        Self {
            state: tokio::sync::Mutex::new(state),
            max_output_chars,
            started: now,
            last_action: Mutex::new(now),
            handled: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
            info,
            monitor: None,
        }
    }

    /// Start the shell and every configured plugin. Any failure here is fatal.
    pub async fn start(config: &RuntimeConfig) -> Result<Self> {
        let shell_config = config.shell_config();
        let work_dir = shell_config.work_dir.clone();
        let shell = tokio::task::spawn_blocking(move || ShellSession::spawn(shell_config))
            .await
            .context("shell startup task failed")?
            .context("failed to start shell session")?;
        info!(work_dir = %work_dir.display(), "shell session ready");

        let mut plugins = PluginRegistry::from_config(config);
        let ctx = PluginContext {
            work_dir,
            username: config.runtime.username.clone(),
        };
        plugins
            .initialize_all(&ctx, config.plugin_init_timeout())
            .await
            .context("plugin initialization failed")?;

        let policy = ActionPolicy::from_config(config)?;
        let files = FileOperations::from_config(config);
        let state = RuntimeState::new(Box::new(shell), files, plugins, policy);
        let mut dispatcher = Self::new(state, config.runtime.max_output_chars);

        if config.monitor.enabled {
            let limit = config
                .monitor
                .max_memory_mb
                .map(|mb| mb.saturating_mul(1024 * 1024));
            let interval = Duration::from_secs(config.monitor.interval_secs);
            dispatcher.monitor =
                Some(ResourceMonitor::new(std::process::id(), limit, interval).spawn());
        }
        Ok(dispatcher)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub async fn run_action(&self, action: Action) -> Observation {
        self.run_request(None, action).await
    }

    /// Run one action under the exclusivity lock.
    pub async fn run_request(&self, id: Option<u64>, action: Action) -> Observation {
        let mut state = self.state.lock().await;
        if self.is_fatal() {
            return Observation::error(ErrorKind::Process, SESSION_ENDED_MSG);
        }

        let kind = action.kind();
        let started = Instant::now();
        let mut observation = handlers::route(&action, &mut state)
            .await
            .unwrap_or_else(RuntimeError::into_observation);
        self.normalize(&mut observation);
        if observation.is_session_fatal() {
            self.fatal.store(true, Ordering::SeqCst);
            error!(action_kind = %kind, message = %observation.content(), "session is no longer usable");
        }
        drop(state);
        self.handled.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_action.lock() {
            *last = Instant::now();
        }

        let exit_code = match &observation {
            Observation::CommandOutput(output) => Some(output.exit_code),
            _ => None,
        };
        let record = json!({
            log_schema::EVENT_TYPE: "action_completed",
            log_schema::COMPONENT: "dispatcher",
            log_schema::ACTION_ID: id,
            log_schema::ACTION_KIND: kind.as_str(),
            log_schema::EXIT_CODE: exit_code,
            log_schema::DURATION_MS: started.elapsed().as_millis() as u64,
            "target": audit_target(&action),
            "error_kind": observation.error_kind().map(|kind| kind.as_str()),
        });
        info!(target: "sandbox_runtime::audit", record = %record, "action completed");
        observation
    }

    /// Strip terminal control sequences, then enforce the output budget.
    fn normalize(&self, observation: &mut Observation) {
        if let Some(text) = observation.terminal_text_mut() {
            let cleaned = strip_ansi(text);
            *text = truncate_middle(&cleaned, self.max_output_chars);
        }
    }

    pub fn alive(&self) -> serde_json::Value {
        if self.is_fatal() {
            json!({"status": "dead"})
        } else {
            json!({"status": "ok"})
        }
    }

    pub fn server_info(&self) -> serde_json::Value {
        let idle = self
            .last_action
            .lock()
            .map(|last| last.elapsed().as_secs())
            .unwrap_or_default();
        json!({
            "uptime_seconds": self.started.elapsed().as_secs(),
            "idle_seconds": idle,
            "handled_actions": self.handled.load(Ordering::SeqCst),
            "fatal": self.is_fatal(),
            "plugins": self.info.plugins,
            "memory": self.monitor.as_ref().and_then(MonitorHandle::latest),
            "editor": self.info.editor.as_ref().map(|(port, token)| json!({
                "port": port,
                "token": token,
            })),
        })
    }

    /// Stop plugins and the shell. Waits for the in-flight action, if any.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.plugins.shutdown_all().await;
        if let Ok(mut shell) = state.shell.lock() {
            shell.close();
        }
        info!(
            handled_actions = self.handled.load(Ordering::SeqCst),
            "runtime shut down"
        );
    }
}

/// What the audit record names as the action's subject. Commands are redacted.
fn audit_target(action: &Action) -> String {
    match action {
        Action::RunCommand(action) if action.is_input => "<input>".to_string(),
        Action::RunCommand(action) => redact_command(&action.command),
        Action::RunCodeCell(_) => "<cell>".to_string(),
        Action::ReadFile(action) => action.path.clone(),
        Action::WriteFile(action) => action.path.clone(),
        Action::EditFile(action) => action.path.clone(),
        Action::EditLines(action) => action.path.clone(),
    }
}
