//! Pure line arithmetic behind every edit. Nothing here touches the disk.

use super::FileOpError;
use agent_api_types::{LineEdit, WHOLE_FILE_END, WHOLE_FILE_START};

/// New file content plus where the cursor should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedEdit {
    pub content: String,
    pub first_line: usize,
    pub added_lines: usize,
}

fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

fn terminated(content: &str) -> String {
    if content.is_empty() || content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{content}\n")
    }
}

fn join(lines: Vec<String>) -> String {
    let mut joined = lines.concat();
    if !joined.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

fn ensure_line_break(lines: &mut [String], index: usize) {
    if let Some(line) = lines.get_mut(index) {
        if !line.ends_with('\n') {
            line.push('\n');
        }
    }
}

pub fn line_count(text: &str) -> usize {
    text.split_inclusive('\n').count()
}

fn check_line(line: usize, total: usize) -> Result<(), FileOpError> {
    if line < 1 || line > total {
        return Err(FileOpError::LineNumber(format!(
            "Invalid line number: {line}. Line numbers must be between 1 and {total} (inclusive)."
        )));
    }
    Ok(())
}

fn check_range(start: usize, end: usize, total: usize) -> Result<(), FileOpError> {
    if start < 1 || start > total.max(1) {
        return Err(FileOpError::LineNumber(format!(
            "Invalid start line number: {start}. Line numbers must be between 1 and {total} (inclusive)."
        )));
    }
    if end > total {
        return Err(FileOpError::LineNumber(format!(
            "Invalid end line number: {end}. Line numbers must be between 1 and {total} (inclusive)."
        )));
    }
    if start > end {
        return Err(FileOpError::LineNumber(format!(
            "Invalid line range: {start}-{end}. Start must be less than or equal to end."
        )));
    }
    Ok(())
}

/// Resolve a `(start, end)` pair from a read/write action.
///
/// `(0, -1)` selects the whole file and yields `None`; `end = -1` alone means
/// "through the last line".
pub fn resolve_range(
    start: i64,
    end: i64,
    total: usize,
) -> Result<Option<(usize, usize)>, FileOpError> {
    if start == WHOLE_FILE_START && end == WHOLE_FILE_END {
        return Ok(None);
    }
    let end = if end == WHOLE_FILE_END {
        total as i64
    } else {
        end
    };
    if start < 1 || end < 0 {
        return Err(FileOpError::LineNumber(format!(
            "Invalid line range: {start}-{end}. Line numbers are 1-indexed; use start=0 and end=-1 for the whole file."
        )));
    }
    let (start, end) = (start as usize, end as usize);
    check_range(start, end, total)?;
    Ok(Some((start, end)))
}

/// Lines `start..=end` of `text`.
pub fn slice_lines(text: &str, start: usize, end: usize) -> String {
    text.split_inclusive('\n')
        .skip(start - 1)
        .take(end + 1 - start)
        .collect()
}

/// Replace lines `start..=end` with `content`.
pub fn replace_range(
    original: &str,
    start: usize,
    end: usize,
    content: &str,
) -> Result<ComputedEdit, FileOpError> {
    let lines = split_lines(original);
    check_range(start, end, lines.len())?;
    let inserted = split_lines(&terminated(content));
    let added_lines = inserted.len();
    let mut updated: Vec<String> = lines[..start - 1].to_vec();
    updated.extend(inserted);
    updated.extend_from_slice(&lines[end..]);
    let content = join(updated);
    if content == join(lines) {
        return Err(FileOpError::InvalidEdit(format!(
            "The new content for lines {start}-{end} is identical to the current content. No changes were made."
        )));
    }
    Ok(ComputedEdit {
        content,
        first_line: start,
        added_lines,
    })
}

/// Apply one line-addressed edit.
pub fn apply_line_edit(original: &str, edit: &LineEdit) -> Result<ComputedEdit, FileOpError> {
    match edit {
        LineEdit::Replace {
            start,
            end,
            content,
        } => replace_range(original, *start, *end, content),
        LineEdit::Delete { start, end } => {
            let mut computed = replace_range(original, *start, *end, "")?;
            computed.added_lines = 0;
            Ok(computed)
        }
        LineEdit::InsertBefore { line, content } => insert(original, *line, content, false),
        LineEdit::InsertAfter { line, content } => insert(original, *line, content, true),
        LineEdit::Append { content } => {
            let mut lines = split_lines(original);
            let first_line = lines.len() + 1;
            let last = lines.len().saturating_sub(1);
            ensure_line_break(&mut lines, last);
            let inserted = split_lines(&terminated(content));
            let added_lines = inserted.len();
            lines.extend(inserted);
            Ok(ComputedEdit {
                content: join(lines),
                first_line,
                added_lines,
            })
        }
    }
}

fn insert(
    original: &str,
    line: usize,
    content: &str,
    after: bool,
) -> Result<ComputedEdit, FileOpError> {
    let mut lines = split_lines(original);
    let inserted = split_lines(&terminated(content));
    let added_lines = inserted.len();
    if lines.is_empty() {
        check_line(line, 1)?;
        return Ok(ComputedEdit {
            content: join(inserted),
            first_line: 1,
            added_lines,
        });
    }
    check_line(line, lines.len())?;
    let at = if after { line } else { line - 1 };
    if after {
        ensure_line_break(&mut lines, line - 1);
    }
    lines.splice(at..at, inserted);
    Ok(ComputedEdit {
        content: join(lines),
        first_line: at + 1,
        added_lines,
    })
}

/// String replacement. `old` must occur exactly once unless `replace_all` is set.
pub fn replace_text(
    original: &str,
    old: &str,
    new: &str,
    replace_all: bool,
    display_path: &str,
) -> Result<ComputedEdit, FileOpError> {
    if old.is_empty() {
        return Err(FileOpError::InvalidEdit(
            "`old_str` must not be empty.".to_string(),
        ));
    }
    if old == new {
        return Err(FileOpError::InvalidEdit(
            "`old_str` and `new_str` are identical. No changes were made.".to_string(),
        ));
    }
    let positions: Vec<usize> = original.match_indices(old).map(|(idx, _)| idx).collect();
    let line_of = |pos: usize| original[..pos].matches('\n').count() + 1;
    let Some(first) = positions.first().copied() else {
        return Err(FileOpError::InvalidEdit(format!(
            "No replacement was performed, old_str `{old}` did not appear verbatim in {display_path}."
        )));
    };
    if positions.len() > 1 && !replace_all {
        let lines: Vec<usize> = positions.iter().map(|pos| line_of(*pos)).collect();
        return Err(FileOpError::InvalidEdit(format!(
            "No replacement was performed. Multiple occurrences of old_str `{old}` in lines {lines:?}. Please ensure it is unique."
        )));
    }
    let mut content = if replace_all {
        original.replace(old, new)
    } else {
        original.replacen(old, new, 1)
    };
    if !content.ends_with('\n') {
        content.push('\n');
    }
    Ok(ComputedEdit {
        content,
        first_line: line_of(first),
        added_lines: line_count(new),
    })
}
