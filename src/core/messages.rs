//! Message history sent with every model step.
//!
//! Order: repository map exchange, context files, prior conversation, then
//! the new prompt. Context is framed as short user/assistant exchanges so the
//! history keeps alternating roles.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::models::{ContentBlock, ImageSource, Message, SystemPrompt};
use crate::profile::AgentProfile;

use super::context::{ContextFile, TaskContext};

const ACK: &str = "Ok, I will use them as a reference.";

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8000;

/// Build the full message list for a step.
pub async fn prepare_messages(
    profile: &AgentProfile,
    task: &dyn TaskContext,
    prompt: Option<&str>,
) -> Vec<Message> {
    let mut messages = Vec::new();

    if profile.include_repo_map
        && let Some(repo_map) = task.repo_map().await
        && !repo_map.trim().is_empty()
    {
        messages.push(Message::user(format!(
            "Here is a map of the repository, listing the important files and symbols:\n\n{repo_map}"
        )));
        messages.push(Message::assistant(
            "Ok, I will use the repository map to find my way around.",
        ));
    }

    let files = task.context_files().await;
    if profile.include_context_files {
        messages.extend(context_file_messages(task.project_dir(), &files).await);
    } else if !files.is_empty() {
        messages.extend(working_file_list(&files));
    }

    messages.extend(task.context_messages().await);

    if let Some(prompt) = prompt {
        messages.push(Message::user(prompt));
    }
    messages
}

/// System prompt for a run.
pub fn system_prompt(profile: &AgentProfile, task: &dyn TaskContext) -> SystemPrompt {
    let mut prompt = format!(
        "You are an expert software engineer working in the project at {}.\n\
         The current working directory is {}.\n\
         Use the available tools to inspect and change the code. Tool names have the form \
         server---tool. When the task is done, answer with a short summary of what changed.",
        task.project_dir().display(),
        task.task_dir().display(),
    );
    if let Some(instructions) = profile
        .custom_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        prompt.push_str("\n\n");
        prompt.push_str(instructions);
    }
    SystemPrompt::Text(prompt)
}

async fn context_file_messages(project_dir: &Path, files: &[ContextFile]) -> Vec<Message> {
    let (read_only, editable): (Vec<&ContextFile>, Vec<&ContextFile>) =
        files.iter().partition(|file| file.read_only);

    let mut messages = Vec::new();
    if let Some(blocks) = file_blocks(project_dir, &read_only).await {
        messages.push(Message::user(
            "The following files are provided as read-only reference. Do not edit them.",
        ));
        messages.push(Message::assistant("Ok, I will not edit these files."));
        messages.push(user_blocks(blocks));
        messages.push(Message::assistant(ACK));
    }
    if let Some(blocks) = file_blocks(project_dir, &editable).await {
        messages.push(Message::user(
            "The following files were added to the context and may be edited.",
        ));
        messages.push(Message::assistant("Ok, I can edit these files when needed."));
        messages.push(user_blocks(blocks));
        messages.push(Message::assistant(ACK));
    }
    messages
}

fn working_file_list(files: &[ContextFile]) -> Vec<Message> {
    let list = files
        .iter()
        .map(|file| {
            if file.read_only {
                format!("- {} (read-only)", file.path)
            } else {
                format!("- {}", file.path)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        Message::user(format!(
            "These are the files I am working with. Read them with your tools when needed:\n{list}"
        )),
        Message::assistant("Ok, I will read them when I need them."),
    ]
}

fn user_blocks(content: Vec<ContentBlock>) -> Message {
    Message {
        role: "user".to_string(),
        content,
    }
}

/// Content blocks for `files`, or `None` when none of them could be inlined.
async fn file_blocks(project_dir: &Path, files: &[&ContextFile]) -> Option<Vec<ContentBlock>> {
    let mut blocks = Vec::new();
    for file in files {
        let path = resolve(project_dir, &file.path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %path.display(), "Skipping unreadable context file: {err}");
                continue;
            }
        };

        if let Some(media_type) = image_media_type(&path) {
            blocks.push(ContentBlock::text(format!("Image: {}", file.path)));
            blocks.push(ContentBlock::Image {
                source: ImageSource {
                    source_type: "base64".to_string(),
                    media_type: media_type.to_string(),
                    data: BASE64.encode(&bytes),
                },
            });
            continue;
        }

        if is_binary(&bytes) {
            tracing::debug!(path = %path.display(), "Skipping binary context file");
            continue;
        }
        let Ok(text) = String::from_utf8(bytes) else {
            tracing::debug!(path = %path.display(), "Skipping non UTF-8 context file");
            continue;
        };
        blocks.push(ContentBlock::text(format!("File: {}\n```\n{text}\n```", file.path)));
    }
    (!blocks.is_empty()).then_some(blocks)
}

fn resolve(project_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

fn image_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0)
}
