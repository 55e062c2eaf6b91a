//! Turns a raw kernel reply into an observation.

use crate::files::unified_diff;
use agent_api_types::{CodeOutput, FileEdit, FileRead, Observation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

pub const PIP_INSTALLED_MSG: &str = "[Package installed successfully]";
pub const PIP_ALREADY_INSTALLED_MSG: &str = "[Package(s) already installed]";

static INLINE_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:image/[a-z0-9.+-]+;base64,[A-Za-z0-9+/=]+").expect("image pattern is valid")
});

static PIP_INSTALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*[!%]pip\s+install\s+(.+)$").expect("pip pattern is valid")
});

static STRUCTURED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<sandbox_output_([0-9a-f]{32})>(.*?)</sandbox_output_([0-9a-f]{32})>")
        .expect("structured output pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KernelReply {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub error: bool,
}

/// Payload emitted by file helpers running inside the kernel.
#[derive(Debug, Deserialize)]
struct StructuredPayload {
    path: String,
    #[serde(default)]
    new_content: Option<String>,
    #[serde(default)]
    old_content: Option<String>,
    #[serde(default)]
    prev_exist: bool,
    #[serde(default)]
    formatted_output_and_error: String,
}

pub fn to_observation(code: &str, reply: KernelReply) -> Observation {
    let mut image_urls = Vec::new();
    let mut content = INLINE_IMAGE
        .replace_all(&reply.output, |caps: &regex::Captures<'_>| {
            image_urls.push(caps[0].to_string());
            format!("[image {}]", image_urls.len() - 1)
        })
        .into_owned();
    for url in reply.images {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        image_urls.push(url);
        content.push_str(&format!("[image {}]", image_urls.len() - 1));
    }

    if let Some(message) = summarize_pip(code, &content) {
        content = message.to_string();
    }
    let content = content.trim_end().to_string();

    match structured(&content) {
        Some(observation) => observation,
        None => Observation::CodeOutput(CodeOutput {
            content,
            code: code.to_string(),
            image_urls,
        }),
    }
}

/// Short message replacing installer output, when the cell was a pip install.
fn summarize_pip(code: &str, output: &str) -> Option<&'static str> {
    let caps = PIP_INSTALL.captures(code)?;
    let packages: Vec<&str> = caps[1]
        .split_whitespace()
        .filter(|arg| !arg.starts_with('-'))
        .collect();
    if !packages.is_empty()
        && packages
            .iter()
            .all(|pkg| output.contains(&format!("Requirement already satisfied: {pkg}")))
    {
        return Some(PIP_ALREADY_INSTALLED_MSG);
    }
    output
        .contains("Successfully installed")
        .then_some(PIP_INSTALLED_MSG)
}

fn structured(content: &str) -> Option<Observation> {
    let blocks: Vec<&str> = STRUCTURED
        .captures_iter(content)
        .filter(|caps| caps[1] == caps[3])
        .filter_map(|caps| caps.get(2).map(|body| body.as_str()))
        .collect();
    match blocks.as_slice() {
        [] => None,
        [single] => Some(match serde_json::from_str::<StructuredPayload>(single.trim()) {
            Ok(payload) => payload_observation(payload),
            Err(err) => invalid_payload(&err),
        }),
        many => {
            let joined = many
                .iter()
                .map(|body| match serde_json::from_str::<StructuredPayload>(body.trim()) {
                    Ok(payload) => payload.formatted_output_and_error,
                    Err(err) => invalid_payload(&err).content().to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            Some(Observation::CodeOutput(CodeOutput {
                content: joined,
                code: String::new(),
                image_urls: Vec::new(),
            }))
        }
    }
}

fn invalid_payload(err: &serde_json::Error) -> Observation {
    Observation::CodeOutput(CodeOutput {
        content: format!("[Kernel produced invalid structured output: {err}]"),
        code: String::new(),
        image_urls: Vec::new(),
    })
}

fn payload_observation(payload: StructuredPayload) -> Observation {
    match payload.new_content {
        Some(new_content) => {
            let old = payload.old_content.clone().unwrap_or_default();
            let cursor_line = first_changed_line(&old, &new_content);
            Observation::FileEdit(FileEdit {
                diff: unified_diff(&payload.path, &old, &new_content),
                path: payload.path,
                content: payload.formatted_output_and_error,
                prev_exist: payload.prev_exist,
                old_content: payload.old_content,
                new_content,
                cursor_line,
            })
        }
        None => Observation::FileRead(FileRead {
            path: payload.path,
            content: payload.formatted_output_and_error,
        }),
    }
}

fn first_changed_line(old: &str, new: &str) -> usize {
    old.lines()
        .zip(new.lines())
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| old.lines().count().min(new.lines().count()))
        + 1
}
