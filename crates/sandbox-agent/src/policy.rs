//! Capability checks run before an action is routed.
//!
//! Two rules: protected paths may only be touched by read-only tools, and
//! code cells may not import denied modules.

use crate::config::RuntimeConfig;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

/// First words of shell statements allowed to reference protected paths.
pub const READ_ONLY_TOOLS: &[&str] = &["cat", "head", "tail", "less", "grep", "ls", "wc", "diff"];

static WRITEFILE_MAGIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*%%writefile(?:\s+-a)?\s+(\S+)").expect("writefile pattern is valid")
});

/// Lexically normalize `path`, resolving `.` and `..` without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ProtectedPaths {
    roots: Vec<PathBuf>,
}

impl ProtectedPaths {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots: roots.iter().map(|root| normalize(root)).collect(),
        }
    }

    /// Relative entries are anchored at the configured work dir.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let work_dir = config.work_dir();
        Self::new(
            config
                .files
                .protected_paths
                .iter()
                .map(|path| {
                    if path.is_absolute() {
                        path.clone()
                    } else {
                        work_dir.join(path)
                    }
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.roots.iter().any(|root| path.starts_with(root))
    }

    /// The protected root that `word` names, seen from `cwd`.
    fn named_by(&self, word: &str, cwd: &Path) -> Option<&Path> {
        let word = word.trim_matches(|c| matches!(c, '"' | '\'' | '>' | '<' | '(' | ')'));
        if word.is_empty() || word.starts_with('-') {
            return None;
        }
        let candidate = if Path::new(word).is_absolute() {
            PathBuf::from(word)
        } else {
            cwd.join(word)
        };
        let candidate = normalize(&candidate);
        self.roots
            .iter()
            .find(|root| candidate.starts_with(root))
            .map(PathBuf::as_path)
    }
}

/// Rules applied before routing shell and code actions.
#[derive(Debug, Clone, Default)]
pub struct ActionPolicy {
    protected: ProtectedPaths,
    denied_modules: Vec<(String, Vec<Regex>)>,
}

impl ActionPolicy {
    pub fn new(protected: ProtectedPaths, denied_modules: &[String]) -> Result<Self> {
        let denied_modules = denied_modules
            .iter()
            .map(|module| {
                let patterns = import_patterns(module)
                    .with_context(|| format!("invalid denied module name `{module}`"))?;
                Ok((module.clone(), patterns))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            protected,
            denied_modules,
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Self::new(
            ProtectedPaths::from_config(config),
            &config.policy.denied_modules,
        )
    }

    /// Reject statements that reference a protected path unless they start
    /// with a read-only tool.
    pub fn check_command(&self, command: &str, cwd: &Path) -> Result<(), String> {
        if self.protected.is_empty() {
            return Ok(());
        }
        for statement in sandbox_shell::split_commands(command) {
            let mut words = statement.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            let tool = Path::new(first)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(first);
            if READ_ONLY_TOOLS.contains(&tool) {
                continue;
            }
            let words = std::iter::once(first).chain(words);
            if let Some(root) = words
                .flat_map(|word| word.split(['=', ';', '|', '&']))
                .find_map(|word| self.protected.named_by(word, cwd))
            {
                return Err(format!(
                    "Command `{statement}` references the protected path {}. Only read-only tools ({}) may access it.",
                    root.display(),
                    READ_ONLY_TOOLS.join(", ")
                ));
            }
        }
        Ok(())
    }

    pub fn check_code(&self, code: &str, cwd: &Path) -> Result<(), String> {
        for (module, patterns) in &self.denied_modules {
            if patterns.iter().any(|pattern| pattern.is_match(code)) {
                return Err(format!(
                    "Importing module `{module}` is not allowed in this sandbox."
                ));
            }
        }
        for caps in WRITEFILE_MAGIC.captures_iter(code) {
            if let Some(root) = self.protected.named_by(&caps[1], cwd) {
                return Err(format!(
                    "Cannot write into the protected path {} from a code cell.",
                    root.display()
                ));
            }
        }
        Ok(())
    }
}

fn import_patterns(module: &str) -> Result<Vec<Regex>, regex::Error> {
    let name = regex::escape(module.trim());
    Ok(vec![
        Regex::new(&format!(r"(?m)^\s*import\s+[^\n#;]*\b{name}\b"))?,
        Regex::new(&format!(r"(?m)^\s*from\s+{name}(?:\.[\w.]+)?\s+import\b"))?,
        Regex::new(&format!(r#"__import__\(\s*['"]{name}(?:\.[\w.]+)?['"]"#))?,
    ])
}
