//! Runtime configuration: TOML file, then `SANDBOX_*` environment overrides,
//! then command-line flags.

use crate::cli::Cli;
use anyhow::{anyhow, bail, Context, Result};
use sandbox_shell::ShellConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub runtime: RuntimeSection,
    pub shell: ShellSection,
    pub files: FilesSection,
    pub kernel: KernelSection,
    pub editor: EditorSection,
    pub policy: PolicySection,
    pub monitor: MonitorSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSection {
    /// Defaults to the process working directory.
    pub work_dir: Option<PathBuf>,
    pub username: Option<String>,
    /// Owner given to newly created files.
    pub user_id: Option<u32>,
    pub max_output_chars: usize,
    pub plugins: Vec<PluginName>,
    pub plugin_init_timeout_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            work_dir: None,
            username: None,
            user_id: None,
            max_output_chars: 30_000,
            plugins: Vec::new(),
            plugin_init_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ShellSection {
    pub program: String,
    pub args: Vec<String>,
    pub no_change_timeout_secs: u64,
    pub hard_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub startup_timeout_secs: u64,
    pub init_commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub extra_path: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        let shell = ShellConfig::default();
        Self {
            program: shell.program,
            args: shell.args,
            no_change_timeout_secs: 30,
            hard_timeout_secs: 120,
            poll_interval_ms: 100,
            startup_timeout_secs: 30,
            init_commands: Vec::new(),
            env: BTreeMap::new(),
            extra_path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FilesSection {
    pub enable_auto_lint: bool,
    pub protected_paths: Vec<PathBuf>,
    pub new_file_mode: u32,
    /// Extension to linter argv; the file path is appended. An empty argv
    /// disables linting for that extension.
    pub linters: BTreeMap<String, Vec<String>>,
    /// Interpreter for the built-in Python syntax check.
    pub python: String,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            enable_auto_lint: true,
            protected_paths: Vec::new(),
            new_file_mode: 0o644,
            linters: BTreeMap::new(),
            python: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelSection {
    pub python: String,
    /// Run after every kernel (re)start.
    pub init_code: Option<String>,
    pub cell_timeout_secs: u64,
    pub reject_repeated_failures: bool,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            init_code: None,
            cell_timeout_secs: 120,
            reject_repeated_failures: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EditorSection {
    /// Accepts `{port}`, `{token}` and `{work_dir}` placeholders.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub port: u16,
}

impl Default for EditorSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub denied_modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSection {
    pub enabled: bool,
    pub max_memory_mb: Option<u64>,
    pub interval_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_mb: None,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Daily-rolling JSON log files go here when set.
    pub dir: Option<PathBuf>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum PluginName {
    Kernel,
    Editor,
}

impl PluginName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginName::Kernel => "kernel",
            PluginName::Editor => "editor",
        }
    }

    pub fn parse_insensitive(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "kernel" | "jupyter" => Some(PluginName::Kernel),
            "editor" | "vscode" => Some(PluginName::Editor),
            _ => None,
        }
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    env_value(key)
        .map(|raw| {
            parse_bool_flag(&raw).ok_or_else(|| {
                anyhow!(
                    "{key} must be a boolean (true|false|1|0|yes|no|on|off) (found '{raw}')"
                )
            })
        })
        .transpose()
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    env_value(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| anyhow!("{key} must be a non-negative integer (found '{raw}')"))
        })
        .transpose()
}

impl RuntimeConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid runtime configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid TOML in {}", path.display()))
    }

    /// File (when given), environment, then flags; validated.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_value("SANDBOX_WORK_DIR") {
            self.runtime.work_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env_number("SANDBOX_NO_CHANGE_TIMEOUT_SECONDS")? {
            self.shell.no_change_timeout_secs = secs;
        }
        if let Some(secs) = env_number("SANDBOX_HARD_TIMEOUT_SECONDS")? {
            self.shell.hard_timeout_secs = secs;
        }
        if let Some(mb) = env_number("SANDBOX_MAX_MEMORY_MB")? {
            self.monitor.max_memory_mb = Some(mb);
        }
        if let Some(enabled) = env_bool("SANDBOX_MEMORY_MONITOR")? {
            self.monitor.enabled = enabled;
        }
        if let Some(enabled) = env_bool("SANDBOX_ENABLE_AUTO_LINT")? {
            self.files.enable_auto_lint = enabled;
        }
        if let Some(chars) = env_number("SANDBOX_MAX_OUTPUT_CHARS")? {
            self.runtime.max_output_chars = chars;
        }
        if let Some(uid) = env_number("SANDBOX_USER_ID")? {
            self.runtime.user_id = Some(uid);
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.working_dir {
            self.runtime.work_dir = Some(dir.clone());
        }
        if !cli.plugins.is_empty() {
            let mut plugins = cli.plugins.clone();
            plugins.sort();
            plugins.dedup();
            self.runtime.plugins = plugins;
        }
        if let Some(username) = &cli.username {
            self.runtime.username = Some(username.clone());
        }
        if let Some(uid) = cli.user_id {
            self.runtime.user_id = Some(uid);
        }
        if let Some(dir) = &cli.log_dir {
            self.logging.dir = Some(dir.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shell.no_change_timeout_secs == 0 {
            bail!("shell.no_change_timeout_secs must be greater than zero");
        }
        if self.shell.hard_timeout_secs == 0 {
            bail!("shell.hard_timeout_secs must be greater than zero");
        }
        if self.shell.poll_interval_ms == 0 {
            bail!("shell.poll_interval_ms must be greater than zero");
        }
        if self.runtime.max_output_chars == 0 {
            bail!("runtime.max_output_chars must be greater than zero");
        }
        if self.kernel.cell_timeout_secs == 0 {
            bail!("kernel.cell_timeout_secs must be greater than zero");
        }
        if self.monitor.enabled && self.monitor.interval_secs == 0 {
            bail!("monitor.interval_secs must be greater than zero");
        }
        if self.monitor.max_memory_mb == Some(0) {
            bail!("monitor.max_memory_mb must be greater than zero");
        }
        if self.shell.program.trim().is_empty() {
            bail!("shell.program must not be empty");
        }
        if self.runtime.plugins.contains(&PluginName::Editor) && self.editor.command.is_none() {
            bail!("the editor plugin requires editor.command");
        }
        Ok(())
    }

    pub fn work_dir(&self) -> PathBuf {
        self.runtime
            .work_dir
            .clone()
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    pub fn plugin_init_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.plugin_init_timeout_secs)
    }

    pub fn shell_config(&self) -> ShellConfig {
        let mut env = self.shell.env.clone();
        if let Some(username) = &self.runtime.username {
            env.entry("USER".to_string())
                .or_insert_with(|| username.clone());
        }
        ShellConfig {
            program: self.shell.program.clone(),
            args: self.shell.args.clone(),
            work_dir: self.work_dir(),
            env,
            extra_path: self.shell.extra_path.clone(),
            no_change_timeout: Duration::from_secs(self.shell.no_change_timeout_secs),
            default_hard_timeout: Duration::from_secs(self.shell.hard_timeout_secs),
            poll_interval: Duration::from_millis(self.shell.poll_interval_ms),
            startup_timeout: Duration::from_secs(self.shell.startup_timeout_secs),
            init_commands: self.shell.init_commands.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.runtime.max_output_chars, 30_000);
        assert!(config.files.enable_auto_lint);
        assert!(config.runtime.plugins.is_empty());
    }

    #[test]
    fn test_sections_parse() {
        let config = RuntimeConfig::from_toml_str(
            r#"
[runtime]
work_dir = "/workspace"
plugins = ["kernel"]

[shell]
no_change_timeout_secs = 5
init_commands = ["export FOO=1"]

[files]
protected_paths = ["tests"]
linters = { js = ["eslint", "--format", "unix"] }

[policy]
denied_modules = ["requests"]
"#,
        )
        .unwrap();
        assert_eq!(config.work_dir(), PathBuf::from("/workspace"));
        assert_eq!(config.runtime.plugins, vec![PluginName::Kernel]);
        assert_eq!(
            config.shell_config().no_change_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.files.linters["js"][0], "eslint");
        assert_eq!(config.policy.denied_modules, vec!["requests".to_string()]);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(RuntimeConfig::from_toml_str("[shell]\nbogus = 1\n").is_err());
        assert!(RuntimeConfig::from_toml_str("[nope]\n").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_budgets() {
        let mut config = RuntimeConfig::default();
        config.shell.no_change_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.runtime.max_output_chars = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.runtime.plugins = vec![PluginName::Editor];
        assert!(config.validate().is_err());
        config.editor.command = Some("code-server --port {port}".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_bool_flag() {
        assert_eq!(parse_bool_flag(" YES "), Some(true));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }

    #[test]
    fn test_plugin_names() {
        assert_eq!(
            PluginName::parse_insensitive("Jupyter"),
            Some(PluginName::Kernel)
        );
        assert_eq!(PluginName::Editor.to_string(), "editor");
    }

    #[test]
    fn test_shell_config_exports_username() {
        let mut config = RuntimeConfig::default();
        config.runtime.username = Some("agent".into());
        assert_eq!(config.shell_config().env["USER"], "agent");
    }
}
