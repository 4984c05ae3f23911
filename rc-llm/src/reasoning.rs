//! Inline reasoning ("think") segments.
//!
//! Reasoning providers are nudged into emitting `<think> ... </think>` ahead
//! of their answer by suffixing the last prompt turn with [`THINK_OPEN`].

use crate::types::ChatMessage;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Appends the think marker to the final message of a prompt.
pub(crate) fn append_think_marker(messages: &mut [ChatMessage]) {
    if let Some(last) = messages.last_mut() {
        last.content.push_str(THINK_OPEN);
    }
}

/// Splits a completion into its reasoning segment (text before the first
/// `</think>`) and the answer. Both halves are trimmed; a leading `<think>`
/// in the reasoning half is dropped.
pub fn split_reasoning(text: &str) -> (Option<&str>, &str) {
    let Some((before, after)) = text.split_once(THINK_CLOSE) else {
        return (None, text);
    };
    let before = before.trim();
    let before = before.strip_prefix(THINK_OPEN).unwrap_or(before).trim();
    let reasoning = Some(before).filter(|s| !s.is_empty());
    (reasoning, after.trim())
}
