//! Cursor state of the file editor and the numbered window rendering.

use std::path::{Path, PathBuf};

/// Default height of a file view.
pub const WINDOW: usize = 100;
/// Height of the view shown after an edit.
pub const SMALL_WINDOW: usize = 20;

/// Current file and line, owned by the file handler instead of living in globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorState {
    pub current_file: Option<PathBuf>,
    pub current_line: usize,
    pub window: usize,
}

impl Default for EditorState {
    fn default() -> Self {
        Self {
            current_file: None,
            current_line: 1,
            window: WINDOW,
        }
    }
}

impl EditorState {
    pub fn open(&mut self, path: &Path) {
        if self.current_file.as_deref() != Some(path) {
            self.current_line = 1;
        }
        self.current_file = Some(path.to_path_buf());
    }

    pub fn move_to(&mut self, path: &Path, line: usize) {
        self.current_file = Some(path.to_path_buf());
        self.current_line = line.max(1);
    }
}

/// Render `content` around `target_line` as numbered rows with
/// above/below markers.
pub fn render_window(path: &Path, content: &str, target_line: usize, window: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len().max(1);
    let current = target_line.clamp(1, total);
    let half = (window / 2).max(1);
    let start = current.saturating_sub(half).max(1);
    let end = (current + half - 1).min(total);

    let mut out = String::new();
    if start > 1 {
        out.push_str(&format!("({} more lines above)\n", start - 1));
    } else {
        out.push_str(&format!("(File name: {})\n", path.display()));
    }
    let width = end.to_string().len();
    for number in start..=end {
        let line = lines.get(number - 1).copied().unwrap_or_default();
        out.push_str(&format!("{number:>width$}|{line}\n"));
    }
    if end < lines.len() {
        out.push_str(&format!("({} more lines below)\n", lines.len() - end));
    } else {
        out.push_str("(this is the end of the file)\n");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn test_window_at_start_of_file() {
        let out = render_window(Path::new("/w/a.txt"), "a\nb\n", 1, SMALL_WINDOW);
        assert_eq!(out, "(File name: /w/a.txt)\n1|a\n2|b\n(this is the end of the file)");
    }

    #[test]
    fn test_window_in_the_middle() {
        let content = numbered(100);
        let out = render_window(Path::new("a.txt"), &content, 50, 20);
        let first = out.lines().next().unwrap();
        assert_eq!(first, "(39 more lines above)");
        assert!(out.contains("40|line 40"));
        assert!(out.contains("59|line 59"));
        assert!(!out.contains("60|line 60"));
        assert!(out.ends_with("(41 more lines below)"));
    }

    #[test]
    fn test_numbers_are_right_aligned() {
        let content = numbered(12);
        let out = render_window(Path::new("a.txt"), &content, 10, 20);
        assert!(out.contains("\n 9|line 9\n10|line 10\n"));
    }

    #[test]
    fn test_target_is_clamped() {
        let out = render_window(Path::new("a.txt"), "only\n", 40, 20);
        assert!(out.contains("1|only"));
        let out = render_window(Path::new("a.txt"), "", 1, 20);
        assert!(out.contains("1|"));
    }

    #[test]
    fn test_editor_state_tracks_file() {
        let mut state = EditorState::default();
        state.move_to(Path::new("a"), 7);
        state.open(Path::new("a"));
        assert_eq!(state.current_line, 7);
        state.open(Path::new("b"));
        assert_eq!(state.current_line, 1);
        assert_eq!(state.current_file.as_deref(), Some(Path::new("b")));
    }
}
