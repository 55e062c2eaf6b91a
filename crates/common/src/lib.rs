//! Shared utilities for sandbox runtime components

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Deduplicate PATH-like strings while preserving order
pub fn dedupe_path(path: &str) -> String {
    let separator = if cfg!(windows) { ';' } else { ':' };
    let mut seen = HashSet::new();
    let mut deduped = Vec::new();

    for component in path.split(separator) {
        if !component.is_empty() {
            let canonical = component.trim_end_matches('/').trim_end_matches('\\');
            if seen.insert(canonical.to_string()) {
                deduped.push(component);
            }
        }
    }

    deduped.join(&separator.to_string())
}

/// Prepend entries to a PATH-like string, dropping duplicates.
pub fn prepend_path(extra: &[String], path: &str) -> String {
    let separator = if cfg!(windows) { ";" } else { ":" };
    let mut joined = extra.join(separator);
    if !path.is_empty() {
        if !joined.is_empty() {
            joined.push_str(separator);
        }
        joined.push_str(path);
    }
    dedupe_path(&joined)
}

/// Standard log schema constants
pub mod log_schema {
    pub const EVENT_TYPE: &str = "event_type";
    pub const ACTION_ID: &str = "action_id";
    pub const ACTION_KIND: &str = "action_kind";
    pub const COMPONENT: &str = "component";
    pub const EXIT_CODE: &str = "exit_code";
    pub const DURATION_MS: &str = "duration_ms";
}

/// Redact sensitive information from a single command argument
pub fn redact_sensitive(arg: &str) -> String {
    if std::env::var("SANDBOX_LOG_OPTS").as_deref() == Ok("raw") {
        return arg.to_string();
    }

    // Token/password patterns
    let upper = arg.to_ascii_uppercase();
    if upper.contains("TOKEN=") || upper.contains("PASSWORD=") || upper.contains("SECRET=") {
        let parts: Vec<&str> = arg.splitn(2, '=').collect();
        if parts.len() == 2 {
            return format!("{}=***", parts[0]);
        }
    }

    // Flag-based redaction
    match arg {
        "--token" | "--password" | "-p" | "-H" | "--header" => "***".to_string(),
        _ => arg.to_string(),
    }
}

/// Redact a whole command line for logging. Values following secret flags are masked too.
pub fn redact_command(command: &str) -> String {
    let mut out = Vec::new();
    let mut mask_next = false;
    for word in command.split_whitespace() {
        if mask_next {
            out.push("***".to_string());
            mask_next = false;
            continue;
        }
        let redacted = redact_sensitive(word);
        mask_next = redacted == "***";
        out.push(redacted);
    }
    out.join(" ")
}

pub mod text {
    use super::*;

    /// Marker inserted where [`truncate_middle`] removed content.
    pub const TRUNCATION_NOTICE: &str = "\n[... Observation truncated due to length ...]\n";

    static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]")
            .expect("ansi escape pattern is valid")
    });

    /// Remove terminal color and cursor control sequences.
    pub fn strip_ansi(input: &str) -> String {
        if !input.contains('\x1b') {
            return input.to_string();
        }
        ANSI_ESCAPE.replace_all(input, "").into_owned()
    }

    /// Keep the head and tail of `input` so the result holds at most `max_chars`
    /// characters of original content.
    pub fn truncate_middle(input: &str, max_chars: usize) -> String {
        let total = input.chars().count();
        if total <= max_chars {
            return input.to_string();
        }
        let half = max_chars / 2;
        let head_end = byte_offset(input, half);
        let tail_start = byte_offset(input, total - half);
        let mut out = String::with_capacity(head_end + TRUNCATION_NOTICE.len() + half * 4);
        out.push_str(&input[..head_end]);
        out.push_str(TRUNCATION_NOTICE);
        out.push_str(&input[tail_start..]);
        out
    }

    fn byte_offset(input: &str, char_index: usize) -> usize {
        input
            .char_indices()
            .nth(char_index)
            .map(|(idx, _)| idx)
            .unwrap_or(input.len())
    }
}
