//! Sentinel prompt injected as `PS1` so completion can be detected in the raw
//! PTY byte stream.

use regex::bytes::Regex;
use serde::Deserialize;

const MARKER_PREFIX: &str = "SANDBOX_PS1";

/// Fields the prompt reports after every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFields {
    pub exit_code: i32,
    pub pid: Option<i64>,
    pub working_dir: String,
    pub username: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFields {
    exit_code: String,
    #[serde(default)]
    pid: String,
    working_dir: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    hostname: String,
}

impl RawFields {
    fn into_fields(self) -> Option<PromptFields> {
        let exit_code = self.exit_code.trim().parse::<i32>().ok()?;
        let non_empty = |value: String| (!value.is_empty()).then_some(value);
        Some(PromptFields {
            exit_code,
            pid: self.pid.trim().parse::<i64>().ok(),
            working_dir: self.working_dir,
            username: non_empty(self.username),
            hostname: non_empty(self.hostname),
        })
    }
}

/// A complete prompt block found in the buffer. Offsets are byte offsets into
/// the searched slice; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelMatch {
    pub start: usize,
    pub end: usize,
    pub fields: PromptFields,
}

#[derive(Debug, Clone)]
pub struct PromptSentinel {
    id: String,
    pattern: Regex,
}

impl PromptSentinel {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::now_v7().simple().to_string())
    }

    /// `id` must be alphanumeric; it becomes part of the marker text.
    pub fn with_id(id: impl Into<String>) -> Self {
        let id: String = id.into();
        let id: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let pattern = format!(
            r"(?s){begin}\r?\n(.*?)\r?\n{end}",
            begin = regex::escape(&Self::marker(&id, "BEGIN")),
            end = regex::escape(&Self::marker(&id, "END")),
        );
        let pattern =
            Regex::new(&pattern).expect("sentinel pattern is built from escaped alphanumerics");
        Self { id, pattern }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn marker(id: &str, edge: &str) -> String {
        format!("###{MARKER_PREFIX}_{id}_{edge}###")
    }

    /// Marker text as it appears inside the single-quoted `PS1` assignment. The
    /// `''` split keeps the echoed assignment from matching the pattern.
    fn quoted_marker(&self, edge: &str) -> String {
        format!("###{MARKER_PREFIX}_{}''_{edge}###", self.id)
    }

    /// Value assigned to `PS1`, already single-quoted for the shell.
    pub fn ps1_assignment(&self) -> String {
        let json = r#"{"pid":"$!","exit_code":"$?","username":"\u","hostname":"\h","working_dir":"$(pwd)"}"#;
        format!(
            r"PS1='\n{begin}\n{json}\n{end}'",
            begin = self.quoted_marker("BEGIN"),
            end = self.quoted_marker("END"),
        )
    }

    /// One line that turns an interactive bash into a sentinel-driven session.
    pub fn bootstrap_command(&self) -> String {
        format!(
            "stty -echo 2>/dev/null; set +H; unset PROMPT_COMMAND; PS2=''; {}\n",
            self.ps1_assignment()
        )
    }

    /// First complete prompt block in `buf` with parseable fields.
    ///
    /// Blocks with malformed JSON or a non-numeric exit code are skipped.
    pub fn find(&self, buf: &[u8]) -> Option<SentinelMatch> {
        self.pattern.captures_iter(buf).find_map(|caps| {
            let whole = caps.get(0)?;
            let body = caps.get(1)?;
            let text = std::str::from_utf8(body.as_bytes()).ok()?;
            let raw: RawFields = serde_json::from_str(text.trim()).ok()?;
            let fields = raw.into_fields()?;
            Some(SentinelMatch {
                start: whole.start(),
                end: whole.end(),
                fields,
            })
        })
    }

    /// Offset in `buf` where a prompt block that has not fully arrived may
    /// start, or `buf.len()` when the tail cannot be part of one.
    pub fn incomplete_start(&self, buf: &[u8]) -> usize {
        let begin = Self::marker(&self.id, "BEGIN");
        let end = Self::marker(&self.id, "END");
        let (begin, end) = (begin.as_bytes(), end.as_bytes());
        if let Some(pos) = buf.windows(begin.len()).rposition(|w| w == begin) {
            if !buf[pos..].windows(end.len()).any(|w| w == end) {
                return pos;
            }
        }
        (1..begin.len().min(buf.len() + 1))
            .rev()
            .find(|&len| buf.ends_with(&begin[..len]))
            .map_or(buf.len(), |len| buf.len() - len)
    }

    /// Render a prompt block the way bash would print it.
    #[cfg(test)]
    pub(crate) fn render(&self, exit_code: i32, working_dir: &str) -> String {
        format!(
            "\r\n{begin}\r\n{{\"pid\":\"\",\"exit_code\":\"{exit_code}\",\"username\":\"agent\",\"hostname\":\"box\",\"working_dir\":\"{working_dir}\"}}\r\n{end}",
            begin = Self::marker(&self.id, "BEGIN"),
            end = Self::marker(&self.id, "END"),
        )
    }
}

impl Default for PromptSentinel {
    fn default() -> Self {
        Self::new()
    }
}
