use crate::config::PluginName;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "sandbox-runtime")]
#[command(version, about = "Sandboxed action-execution runtime speaking JSON lines over stdio", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Working directory for the shell, kernel and relative file paths
    #[arg(long = "working-dir", value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Plugins to start, comma separated
    #[arg(long = "plugins", value_enum, value_delimiter = ',')]
    pub plugins: Vec<PluginName>,

    /// User name exported to the shell
    #[arg(long = "username", value_name = "NAME")]
    pub username: Option<String>,

    /// Numeric owner for newly created files
    #[arg(long = "user-id", value_name = "UID")]
    pub user_id: Option<u32>,

    /// Directory for rolling JSON log files
    #[arg(long = "log-dir", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::try_parse_from([
            "sandbox-runtime",
            "--working-dir",
            "/workspace",
            "--plugins",
            "kernel,editor",
            "--user-id",
            "1000",
            "--username",
            "agent",
        ])
        .unwrap();
        assert_eq!(cli.working_dir, Some(PathBuf::from("/workspace")));
        assert_eq!(cli.plugins, vec![PluginName::Kernel, PluginName::Editor]);
        assert_eq!(cli.user_id, Some(1000));
        assert_eq!(cli.username.as_deref(), Some("agent"));
    }

    #[test]
    fn test_unknown_plugin_is_rejected() {
        assert!(Cli::try_parse_from(["sandbox-runtime", "--plugins", "browser"]).is_err());
    }
}
