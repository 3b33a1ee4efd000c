//! ChatML prompt formatting.

use super::{ChatMessage, CompletionRequest};

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";

/// Seed used for reproducible chat completions.
pub const DEFAULT_SEED: i64 = 1337;

/// Render messages as a ChatML prompt, optionally opening the assistant turn.
pub fn format_chatml(messages: &[ChatMessage], add_assistant_preprompt: bool) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(IM_START);
        out.push_str(&msg.role);
        out.push('\n');
        out.push_str(&msg.content);
        out.push_str(IM_END);
        out.push('\n');
    }
    if add_assistant_preprompt {
        out.push_str(IM_START);
        out.push_str("assistant\n");
    }
    out
}

/// Strip every trailing occurrence of `pattern`.
pub fn trim_suffix<'a>(mut s: &'a str, pattern: &str) -> &'a str {
    if pattern.is_empty() {
        return s;
    }
    while let Some(stripped) = s.strip_suffix(pattern) {
        s = stripped;
    }
    s
}

/// Cut generated text at the first leaked ChatML marker.
pub fn fix_chatml_markup(s: &str) -> &str {
    let mut s = trim_suffix(s, IM_END);
    if let Some(i) = s.find(IM_END) {
        s = &s[..i];
    }
    if let Some(i) = s.find(IM_START) {
        s = &s[..i];
    }
    s
}

/// Deterministic completion request for an optional system and user message.
pub fn chat_request(system: Option<&str>, user: Option<&str>) -> CompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    if let Some(user) = user {
        messages.push(ChatMessage::user(user));
    }
    CompletionRequest::new(format_chatml(&messages, true))
        .with_stop(IM_END)
        .deterministic(DEFAULT_SEED)
}

/// Text of the last user turn in a ChatML prompt, if any.
pub fn last_user_message(prompt: &str) -> Option<&str> {
    let marker = format!("{IM_START}user\n");
    let start = prompt.rfind(&marker)? + marker.len();
    let rest = &prompt[start..];
    Some(rest.find(IM_END).map_or(rest, |end| &rest[..end]))
}
