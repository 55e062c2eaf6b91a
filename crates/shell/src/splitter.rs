//! Grammar-aware splitting and escaping of multi-statement shell input.
//!
//! Both routines parse with tree-sitter-bash so that quoting, command
//! substitutions and here-documents are never cut mid-token. Input that does
//! not parse cleanly is treated as one opaque command.

use std::ops::Range;
use tree_sitter::{Node, Parser, Tree};

/// Node kinds whose text is left untouched by [`escape_special_chars`].
const OPAQUE_KINDS: &[&str] = &[
    "string",
    "raw_string",
    "ansi_c_string",
    "translated_string",
    "command_substitution",
    "process_substitution",
    "heredoc_body",
];

const CONTROL_OPERATORS: &[u8] = b";&|><";

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("failed to load bash grammar: {0}")]
    Language(String),
    #[error("bash parser produced no tree")]
    NoTree,
    #[error("syntax error at line {line}, column {column}")]
    Syntax { line: usize, column: usize },
}

pub(crate) fn parse_bash(source: &str) -> Result<Tree, SplitError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .map_err(|err| SplitError::Language(err.to_string()))?;
    parser.parse(source, None).ok_or(SplitError::NoTree)
}

/// Parse `source` and fail on the first ERROR or MISSING node.
pub fn parse_strict(source: &str) -> Result<Tree, SplitError> {
    let tree = parse_bash(source)?;
    let root = tree.root_node();
    if root.has_error() {
        let (line, column) = first_error(root)
            .map(|node| {
                let pos = node.start_position();
                (pos.row + 1, pos.column + 1)
            })
            .unwrap_or((1, 1));
        return Err(SplitError::Syntax { line, column });
    }
    Ok(tree)
}

/// One ERROR or MISSING node, 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Every syntax problem tree-sitter-bash reports for `source`.
pub fn syntax_issues(source: &str) -> Result<Vec<SyntaxIssue>, SplitError> {
    let tree = parse_bash(source)?;
    let mut issues = Vec::new();
    collect_issues(tree.root_node(), &mut issues);
    Ok(issues)
}

fn collect_issues(node: Node<'_>, out: &mut Vec<SyntaxIssue>) {
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        let message = if node.is_missing() {
            format!("Missing node: expected `{}`", node.kind())
        } else {
            "Syntax error".to_string()
        };
        out.push(SyntaxIssue {
            line: pos.row + 1,
            column: pos.column + 1,
            message,
        });
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_issues(child, out);
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}

/// Split `source` into top-level statements separated by `;`, `&` or newlines.
///
/// `&&`/`||` chains and pipelines stay one statement. Text between two
/// statements (comments, terminators) belongs to the earlier one; a trailing
/// `;` is dropped while a trailing `&` is kept.
pub fn split_commands(source: &str) -> Vec<String> {
    if source.trim().is_empty() {
        return Vec::new();
    }
    let tree = match parse_strict(source) {
        Ok(tree) => tree,
        Err(err) => {
            tracing::debug!(error = %err, "falling back to unsplit command");
            return vec![source.trim().to_string()];
        }
    };

    let root = tree.root_node();
    let mut cursor = root.walk();
    let starts: Vec<usize> = root
        .named_children(&mut cursor)
        .filter(|node| !matches!(node.kind(), "comment" | "heredoc_body"))
        .map(|node| node.start_byte())
        .collect();
    if starts.is_empty() {
        return vec![source.trim().to_string()];
    }

    let mut commands = Vec::with_capacity(starts.len());
    for (idx, start) in starts.iter().enumerate() {
        let begin = if idx == 0 { 0 } else { *start };
        let end = starts.get(idx + 1).copied().unwrap_or(source.len());
        let piece = clean_statement(&source[begin..end]);
        if !piece.is_empty() {
            commands.push(piece);
        }
    }
    commands
}

fn clean_statement(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_terminator = trimmed
        .strip_suffix(";;")
        .or_else(|| trimmed.strip_suffix(';'))
        .unwrap_or(trimmed);
    without_terminator.trim_end().to_string()
}

/// Double the backslash of escaped control operators (`\;` becomes `\\;`)
/// outside quoted words, substitutions and here-document bodies.
///
/// The result is a display and comparison copy; it is never sent to the shell.
pub fn escape_special_chars(source: &str) -> String {
    let tree = match parse_strict(source) {
        Ok(tree) => tree,
        Err(_) => return source.to_string(),
    };
    let mut opaque = Vec::new();
    collect_opaque(tree.root_node(), &mut opaque);
    opaque.sort_by_key(|range| range.start);

    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len() + 8);
    let mut copied = 0;
    let mut idx = 0;
    let mut ranges = opaque.iter().peekable();
    while idx + 1 < bytes.len() {
        while ranges.peek().is_some_and(|range| range.end <= idx) {
            ranges.next();
        }
        if let Some(range) = ranges.peek() {
            if range.contains(&idx) {
                idx = range.end;
                continue;
            }
        }
        if bytes[idx] == b'\\' {
            if CONTROL_OPERATORS.contains(&bytes[idx + 1]) {
                out.push_str(&source[copied..idx]);
                out.push_str("\\\\");
                copied = idx + 1;
            }
            idx += 2;
            continue;
        }
        idx += 1;
    }
    out.push_str(&source[copied..]);
    out
}

fn collect_opaque(node: Node<'_>, out: &mut Vec<Range<usize>>) {
    if OPAQUE_KINDS.contains(&node.kind()) {
        out.push(node.byte_range());
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_opaque(child, out);
    }
}
