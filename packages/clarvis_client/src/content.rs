//! Helpers over message content and session metadata.

use crate::types::{ContentBlock, MessageContent};

/// Plain text of a message: the string itself, text blocks joined by `\n`,
/// or the `text` field of the object form. Anything else is empty.
pub fn extract_text_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Object { text } => text.clone().unwrap_or_default(),
        MessageContent::Other(_) => String::new(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

pub fn has_tool_use(content: &MessageContent) -> bool {
    match content {
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. })),
        _ => false,
    }
}

/// Last `/` segment of a workdir path.
pub fn workdir_name(workdir: &str) -> &str {
    workdir
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(workdir)
}

/// Session name derived from the first prompt.
///
/// Takes the first `max_len` characters and trims them. When the prompt was
/// longer than that and the cut landed inside a word, backs up to the last
/// space and appends `...`.
pub fn derive_session_name(prompt: &str, max_len: usize) -> Option<String> {
    let truncated: String = prompt.chars().take(max_len).collect();
    let truncated = truncated.trim();
    if truncated.is_empty() {
        return None;
    }
    if prompt.chars().count() > max_len {
        if let Some(idx) = truncated.rfind(' ') {
            if idx > 0 {
                return Some(format!("{}...", &truncated[..idx]));
            }
        }
    }
    Some(truncated.to_string())
}
