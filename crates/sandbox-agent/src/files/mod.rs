//! File reads, writes and lint-checked edits.
//!
//! Every mutation goes through [`FileOperations::commit`]: lint the original,
//! write the new content through a sibling temp file, lint again, and roll
//! back when the edit introduced findings the original did not have.

pub mod editor;
pub mod lines;
pub mod lint;
pub mod media;
pub mod transaction;

use crate::config::RuntimeConfig;
use crate::policy::ProtectedPaths;
use agent_api_types::{
    EditFile, EditLines, ErrorKind, FileEdit, FileRead, FileWrite, Observation, ReadFile,
    WriteFile, WHOLE_FILE_END, WHOLE_FILE_START,
};
use editor::{render_window, EditorState, SMALL_WINDOW};
use lines::ComputedEdit;
use lint::{format_findings, introduced, LinterRegistry};
use similar::TextDiff;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use transaction::{write_atomic, FileOwnership, Snapshot};

pub const LINTER_ERROR_MSG: &str = "[Your proposed edit has introduced new error(s). Please explain why you thought it would work and fix the errors.]";
const SEPARATOR: &str = "-------------------------------------------------";
const UPDATED_MSG: &str = "[File updated successfully]";

#[derive(Debug, thiserror::Error)]
pub enum FileOpError {
    #[error("File not found: {path}. Your current working directory is {cwd}.")]
    NotFound { path: String, cwd: String },
    #[error("Path is a directory: {0}. You can only read files")]
    IsDirectory(String),
    #[error("File could not be decoded as utf-8: {0}")]
    NotUtf8(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("{0}")]
    LineNumber(String),
    #[error("{0}")]
    InvalidEdit(String),
    #[error("{0} is a protected path and cannot be modified.")]
    Protected(String),
    #[error("{0}")]
    LintRegression(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FileOpError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            return FileOpError::PermissionDenied(path.display().to_string());
        }
        FileOpError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FileOpError::NotUtf8(_) => ErrorKind::Encoding,
            FileOpError::LintRegression(_) => ErrorKind::LintRegression,
            _ => ErrorKind::Validation,
        }
    }
}

/// Handler for every file action. Owns the editor cursor.
pub struct FileOperations {
    editor: EditorState,
    linters: LinterRegistry,
    protected: ProtectedPaths,
    new_file_mode: u32,
    user_id: Option<u32>,
}

impl FileOperations {
    pub fn new(linters: LinterRegistry, protected: ProtectedPaths) -> Self {
        Self {
            editor: EditorState::default(),
            linters,
            protected,
            new_file_mode: 0o644,
            user_id: None,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            new_file_mode: config.files.new_file_mode,
            user_id: config.runtime.user_id,
            ..Self::new(
                LinterRegistry::from_config(&config.files),
                ProtectedPaths::from_config(config),
            )
        }
    }

    pub fn editor(&self) -> &EditorState {
        &self.editor
    }

    fn resolve(&self, cwd: &Path, raw: &str) -> Result<PathBuf, FileOpError> {
        if raw.trim().is_empty() {
            return Err(FileOpError::InvalidPath("path must not be empty".to_string()));
        }
        let path = Path::new(raw);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        })
    }

    fn guard_mutation(&self, path: &Path) -> Result<(), FileOpError> {
        if self.protected.contains(path) {
            return Err(FileOpError::Protected(path.display().to_string()));
        }
        if path.is_dir() {
            return Err(FileOpError::IsDirectory(path.display().to_string()));
        }
        Ok(())
    }

    fn read_text(path: &Path, cwd: &Path) -> Result<String, FileOpError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FileOpError::NotFound {
                    path: path.display().to_string(),
                    cwd: cwd.display().to_string(),
                })
            }
            Err(err) => return Err(FileOpError::io(path, err)),
        };
        String::from_utf8(bytes).map_err(|_| FileOpError::NotUtf8(path.display().to_string()))
    }

    pub fn read(&mut self, cwd: &Path, action: &ReadFile) -> Result<Observation, FileOpError> {
        let path = self.resolve(cwd, &action.path)?;
        if path.is_dir() {
            return Err(FileOpError::IsDirectory(path.display().to_string()));
        }
        if let Some(mime) = media::media_type(&path) {
            let bytes = fs::read(&path).map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => FileOpError::NotFound {
                    path: path.display().to_string(),
                    cwd: cwd.display().to_string(),
                },
                _ => FileOpError::io(&path, err),
            })?;
            return Ok(Observation::FileRead(FileRead {
                path: path.display().to_string(),
                content: media::data_url(mime, &bytes),
            }));
        }

        let text = Self::read_text(&path, cwd)?;
        let content = match lines::resolve_range(action.start, action.end, lines::line_count(&text))? {
            None => text,
            Some((start, end)) => lines::slice_lines(&text, start, end),
        };
        self.editor.open(&path);
        Ok(Observation::FileRead(FileRead {
            path: path.display().to_string(),
            content,
        }))
    }

    pub fn write(&mut self, cwd: &Path, action: &WriteFile) -> Result<Observation, FileOpError> {
        let path = self.resolve(cwd, &action.path)?;
        self.guard_mutation(&path)?;

        let whole = action.start == WHOLE_FILE_START && action.end == WHOLE_FILE_END;
        let computed = if whole {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| FileOpError::io(parent, err))?;
            }
            let mut content = action.content.clone();
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            ComputedEdit {
                added_lines: lines::line_count(&content),
                content,
                first_line: 1,
            }
        } else {
            let original = Self::read_text(&path, cwd)?;
            let total = lines::line_count(&original);
            let (start, end) = lines::resolve_range(action.start, action.end, total)?
                .unwrap_or((1, total));
            lines::replace_range(&original, start, end, &action.content)?
        };

        let committed = self.commit(&path, computed)?;
        Ok(Observation::FileWrite(FileWrite {
            path: path.display().to_string(),
            content: committed.warnings.join("\n"),
        }))
    }

    pub fn edit(&mut self, cwd: &Path, action: &EditFile) -> Result<Observation, FileOpError> {
        let path = self.resolve(cwd, &action.path)?;
        self.guard_mutation(&path)?;
        let original = Self::read_text(&path, cwd)?;
        let computed = lines::replace_text(
            &original,
            &action.old_str,
            &action.new_str,
            action.replace_all,
            &path.display().to_string(),
        )?;
        self.finish_edit(&path, original, computed)
    }

    pub fn edit_lines(&mut self, cwd: &Path, action: &EditLines) -> Result<Observation, FileOpError> {
        let path = self.resolve(cwd, &action.path)?;
        self.guard_mutation(&path)?;
        let original = Self::read_text(&path, cwd)?;
        let computed = lines::apply_line_edit(&original, &action.edit)?;
        self.finish_edit(&path, original, computed)
    }

    fn finish_edit(
        &mut self,
        path: &Path,
        original: String,
        computed: ComputedEdit,
    ) -> Result<Observation, FileOpError> {
        let new_content = computed.content.clone();
        let cursor_line = computed.first_line;
        let committed = self.commit(path, computed)?;
        let display = path.display().to_string();

        let mut content = render_window(path, &new_content, cursor_line, SMALL_WINDOW);
        content.push('\n');
        content.push_str(UPDATED_MSG);
        for warning in &committed.warnings {
            content.push('\n');
            content.push_str(warning);
        }

        let diff = unified_diff(&display, &original, &new_content);

        Ok(Observation::FileEdit(FileEdit {
            path: display,
            content,
            prev_exist: true,
            old_content: Some(original),
            new_content,
            diff,
            cursor_line,
        }))
    }

    /// Write `computed` to `path` as one transaction.
    fn commit(&mut self, path: &Path, computed: ComputedEdit) -> Result<Committed, FileOpError> {
        let snapshot = Snapshot::capture(path)?;
        let linted = self.linters.covers(path);
        let before = if linted && snapshot.existed() {
            self.linters.lint(path)
        } else {
            Vec::new()
        };

        let ownership = snapshot.ownership().unwrap_or(FileOwnership {
            mode: self.new_file_mode,
            uid: self.user_id,
            gid: None,
        });
        let warning = write_atomic(path, computed.content.as_bytes(), ownership)?;

        if linted {
            let after = self.linters.lint(path);
            let new_findings = introduced(&before, &after);
            if !new_findings.is_empty() {
                let original = snapshot.original_text().unwrap_or_default();
                snapshot.rollback()?;
                info!(
                    path = %path.display(),
                    findings = new_findings.len(),
                    "edit rolled back after lint regression"
                );
                return Err(FileOpError::LintRegression(lint_regression_message(
                    path,
                    &format_findings(path, &new_findings),
                    &computed,
                    &original,
                )));
            }
        }

        debug!(path = %path.display(), created = !snapshot.existed(), "file committed");
        self.editor.move_to(path, computed.first_line);
        Ok(Committed {
            warnings: warning.into_iter().collect(),
        })
    }
}

struct Committed {
    warnings: Vec<String>,
}

/// Unified diff of `old` against `new`, labelled with `path` on both sides.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}

fn lint_regression_message(
    path: &Path,
    errors: &str,
    computed: &ComputedEdit,
    original: &str,
) -> String {
    let line = computed.first_line;
    let proposed = render_window(path, &computed.content, line, SMALL_WINDOW);
    let before = render_window(path, original, line, SMALL_WINDOW);
    format!(
        "{LINTER_ERROR_MSG}\n{errors}\n\n\
         [This is how your edit would have looked if applied]\n{SEPARATOR}\n{proposed}\n{SEPARATOR}\n\n\
         [This is the original code before your edit]\n{SEPARATOR}\n{before}\n{SEPARATOR}\n\
         Your changes have NOT been applied. Please fix your edit command and try again."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_api_types::LineEdit;
    use tempfile::TempDir;

    fn ops() -> FileOperations {
        FileOperations::new(LinterRegistry::disabled(), ProtectedPaths::default())
    }

    fn linted_ops() -> FileOperations {
        let linters = LinterRegistry::disabled().with_linter(
            "sh",
            std::sync::Arc::new(lint::BashSyntaxLinter),
        );
        FileOperations::new(linters, ProtectedPaths::default())
    }

    #[test]
    fn test_relative_paths_resolve_against_cwd() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hi\n").unwrap();
        let mut ops = ops();
        let obs = ops.read(dir.path(), &ReadFile::whole("a.txt")).unwrap();
        match obs {
            Observation::FileRead(read) => {
                assert_eq!(read.content, "hi\n");
                assert!(read.path.ends_with("a.txt"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            ops.editor().current_file.as_deref(),
            Some(dir.path().join("a.txt").as_path())
        );
    }

    #[test]
    fn test_missing_file_names_cwd() {
        let dir = TempDir::new().unwrap();
        let err = ops()
            .read(dir.path(), &ReadFile::whole("nope.txt"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }

    #[test]
    fn test_non_utf8_is_encoding_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();
        let err = ops()
            .read(dir.path(), &ReadFile::whole("blob.bin"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
    }

    #[test]
    fn test_media_read_returns_data_url() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dot.png"), [0x89, b'P', b'N', b'G']).unwrap();
        let obs = ops()
            .read(dir.path(), &ReadFile::whole("dot.png"))
            .unwrap();
        assert!(obs.content().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_ranged_write_replaces_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "a\nb\nc\n").unwrap();
        let action = WriteFile {
            path: "f.txt".into(),
            content: "B".into(),
            start: 2,
            end: 2,
        };
        ops().write(dir.path(), &action).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nB\nc\n");
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = ops()
            .write(dir.path(), &WriteFile::whole(".", "x"))
            .unwrap_err();
        assert!(matches!(err, FileOpError::IsDirectory(_)));
    }

    #[test]
    fn test_lint_regression_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, "echo start\necho end\n").unwrap();
        let mut ops = linted_ops();
        let action = EditLines {
            path: "run.sh".into(),
            edit: LineEdit::Replace {
                start: 1,
                end: 1,
                content: "if true; then".into(),
            },
        };
        let err = ops.edit_lines(dir.path(), &action).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LintRegression);
        let message = err.to_string();
        assert!(message.starts_with(LINTER_ERROR_MSG));
        assert!(message.contains("[This is the original code before your edit]"));
        assert!(message.contains("Your changes have NOT been applied."));
        assert_eq!(fs::read_to_string(&path).unwrap(), "echo start\necho end\n");
    }

    #[test]
    fn test_preexisting_lint_errors_do_not_block_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.sh");
        fs::write(&path, "echo a\nif true; then\n").unwrap();
        let mut ops = linted_ops();
        let action = EditFile {
            path: "broken.sh".into(),
            old_str: "echo a".into(),
            new_str: "echo b".into(),
            replace_all: false,
        };
        ops.edit(dir.path(), &action).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "echo b\nif true; then\n");
    }

    #[test]
    fn test_new_file_with_lint_errors_is_removed() {
        let dir = TempDir::new().unwrap();
        let mut ops = linted_ops();
        let err = ops
            .write(dir.path(), &WriteFile::whole("new.sh", "if true; then\n"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LintRegression);
        assert!(!dir.path().join("new.sh").exists());
    }

    #[test]
    fn test_edit_reports_window_and_diff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.txt");
        fs::write(&path, "x=1\ny=2\n").unwrap();
        let mut ops = ops();
        let obs = ops
            .edit(
                dir.path(),
                &EditFile {
                    path: "cfg.txt".into(),
                    old_str: "y=2".into(),
                    new_str: "y=3".into(),
                    replace_all: false,
                },
            )
            .unwrap();
        let Observation::FileEdit(edit) = obs else {
            panic!("expected file edit");
        };
        assert_eq!(edit.cursor_line, 2);
        assert_eq!(edit.new_content, "x=1\ny=3\n");
        assert!(edit.diff.contains("-y=2"));
        assert!(edit.diff.contains("+y=3"));
        assert!(edit.content.ends_with(UPDATED_MSG));
        assert!(edit.content.contains("2|y=3"));
        assert_eq!(ops.editor().current_line, 2);
    }

    #[test]
    fn test_protected_path_is_not_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tests");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("t.py"), "assert True\n").unwrap();
        let mut ops = FileOperations::new(
            LinterRegistry::disabled(),
            ProtectedPaths::new(vec![path.clone()]),
        );
        let err = ops
            .write(dir.path(), &WriteFile::whole("tests/t.py", "pass\n"))
            .unwrap_err();
        assert!(matches!(err, FileOpError::Protected(_)));
        assert_eq!(fs::read_to_string(path.join("t.py")).unwrap(), "assert True\n");
    }
}
