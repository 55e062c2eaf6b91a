//! Linters consulted before and after every edit.

use crate::config::FilesSection;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintFinding {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Pure function of a file's content: `path -> findings`.
pub trait Linter: Send + Sync {
    fn name(&self) -> &str;

    fn lint(&self, path: &Path) -> Result<Vec<LintFinding>>;
}

/// Syntax check for shell scripts using the bash grammar.
#[derive(Debug, Default)]
pub struct BashSyntaxLinter;

impl Linter for BashSyntaxLinter {
    fn name(&self) -> &str {
        "tree-sitter-bash"
    }

    fn lint(&self, path: &Path) -> Result<Vec<LintFinding>> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let issues = sandbox_shell::syntax_issues(&source)?;
        Ok(issues
            .into_iter()
            .map(|issue| LintFinding {
                line: issue.line,
                column: issue.column,
                message: issue.message,
            })
            .collect())
    }
}

/// Compile check that prints findings in `path:line:col: message` form.
const PYTHON_SYNTAX_CHECK: &str = r#"
import sys
path = sys.argv[1]
try:
    with open(path, "rb") as fh:
        compile(fh.read(), path, "exec")
except SyntaxError as err:
    print(f"{path}:{err.lineno or 1}:{err.offset or 1}: E999 {type(err).__name__}: {err.msg}")
"#;

static FINDING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<path>[^:\n]+):(?P<line>\d+)(?::(?P<col>\d+))?:\s*(?P<msg>.+)$")
        .expect("finding pattern is valid")
});

/// Runs an external program with the file path appended and parses its output.
#[derive(Debug, Clone)]
pub struct CommandLinter {
    name: String,
    argv: Vec<String>,
}

impl CommandLinter {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
        }
    }

    pub fn python(interpreter: &str) -> Self {
        Self::new(
            "python-compile",
            vec![
                interpreter.to_string(),
                "-c".to_string(),
                PYTHON_SYNTAX_CHECK.to_string(),
            ],
        )
    }

    fn parse_output(output: &str) -> Vec<LintFinding> {
        output
            .lines()
            .filter_map(|line| FINDING_LINE.captures(line.trim_end()))
            .filter_map(|caps| {
                Some(LintFinding {
                    line: caps.name("line")?.as_str().parse().ok()?,
                    column: caps
                        .name("col")
                        .and_then(|col| col.as_str().parse().ok())
                        .unwrap_or(1),
                    message: caps.name("msg")?.as_str().trim().to_string(),
                })
            })
            .collect()
    }
}

impl Linter for CommandLinter {
    fn name(&self) -> &str {
        &self.name
    }

    fn lint(&self, path: &Path) -> Result<Vec<LintFinding>> {
        let Some((program, args)) = self.argv.split_first() else {
            return Ok(Vec::new());
        };
        let output = match Command::new(program).args(args).arg(path).output() {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(linter = %self.name, "linter binary not found");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to run linter {}", self.name))
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(Self::parse_output(&text))
    }
}

/// Linters keyed by lowercase file extension.
#[derive(Clone)]
pub struct LinterRegistry {
    enabled: bool,
    by_extension: HashMap<String, Arc<dyn Linter>>,
}

impl LinterRegistry {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            by_extension: HashMap::new(),
        }
    }

    pub fn from_config(files: &FilesSection) -> Self {
        let mut by_extension: HashMap<String, Arc<dyn Linter>> = HashMap::new();
        let bash: Arc<dyn Linter> = Arc::new(BashSyntaxLinter);
        by_extension.insert("sh".to_string(), Arc::clone(&bash));
        by_extension.insert("bash".to_string(), bash);
        by_extension.insert(
            "py".to_string(),
            Arc::new(CommandLinter::python(&files.python)),
        );
        Self::apply_overrides(&mut by_extension, &files.linters);
        Self {
            enabled: files.enable_auto_lint,
            by_extension,
        }
    }

    fn apply_overrides(
        by_extension: &mut HashMap<String, Arc<dyn Linter>>,
        overrides: &BTreeMap<String, Vec<String>>,
    ) {
        for (ext, argv) in overrides {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if argv.is_empty() {
                by_extension.remove(&ext);
            } else {
                by_extension.insert(
                    ext.clone(),
                    Arc::new(CommandLinter::new(format!("{ext}-linter"), argv.clone())),
                );
            }
        }
    }

    pub fn with_linter(mut self, ext: &str, linter: Arc<dyn Linter>) -> Self {
        self.enabled = true;
        self.by_extension.insert(ext.to_ascii_lowercase(), linter);
        self
    }

    fn linter_for(&self, path: &Path) -> Option<&Arc<dyn Linter>> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext)
    }

    /// Whether edits to `path` are lint-checked at all.
    pub fn covers(&self, path: &Path) -> bool {
        self.enabled && self.linter_for(path).is_some()
    }

    /// Findings for `path`; an unavailable or failing linter reports nothing.
    pub fn lint(&self, path: &Path) -> Vec<LintFinding> {
        if !self.enabled {
            return Vec::new();
        }
        let Some(linter) = self.linter_for(path) else {
            return Vec::new();
        };
        match linter.lint(path) {
            Ok(findings) => findings,
            Err(err) => {
                warn!(linter = linter.name(), path = %path.display(), error = %err, "linter failed");
                Vec::new()
            }
        }
    }
}

/// Findings in `after` that `before` does not account for.
///
/// Keyed on message text as a multiset: a finding is new when more findings
/// carry its message after the edit than before. Line numbers are ignored
/// because edits shift them.
pub fn introduced(before: &[LintFinding], after: &[LintFinding]) -> Vec<LintFinding> {
    let mut budget: HashMap<&str, usize> = HashMap::new();
    for finding in before {
        *budget.entry(finding.message.as_str()).or_default() += 1;
    }
    after
        .iter()
        .filter(|finding| match budget.get_mut(finding.message.as_str()) {
            Some(left) if *left > 0 => {
                *left -= 1;
                false
            }
            _ => true,
        })
        .cloned()
        .collect()
}

pub fn format_findings(path: &Path, findings: &[LintFinding]) -> String {
    let mut out = String::from("ERRORS:\n");
    for finding in findings {
        out.push_str(&format!(
            "{}:{}:{}: {}\n",
            path.display(),
            finding.line,
            finding.column,
            finding.message
        ));
    }
    out.trim_end().to_string()
}
