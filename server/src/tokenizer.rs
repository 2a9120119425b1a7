//! Token counting over a Claude-compatible BPE vocabulary.
//!
//! Wraps the embedded `cl100k_base` encoder. Request-level counting adds a
//! fixed per-message framing overhead and folds in serialized tool schemas,
//! matching how the upstream meters input.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::models::NormalizedRequest;

/// Framing overhead charged per message on top of its content tokens.
const PER_MESSAGE_OVERHEAD: u32 = 4;

static BPE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("embedded cl100k vocabulary"));

/// Count BPE tokens in a string. Empty input is zero tokens.
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    BPE.encode_ordinary(text).len() as u32
}

/// Count the input tokens of a normalized request: system prompt, every
/// message (content plus per-message overhead plus tool results), and the
/// serialized tool definitions.
pub fn count_request_tokens(request: &NormalizedRequest) -> u32 {
    let mut total = 0u32;

    if let Some(system) = &request.system {
        total += count_tokens(system) + PER_MESSAGE_OVERHEAD;
    }

    for message in &request.messages {
        total += count_tokens(&message.content) + PER_MESSAGE_OVERHEAD;
        for result in &message.tool_results {
            total += count_tokens(&result.content);
        }
    }

    for tool in &request.tools {
        total += count_tokens(&tool.name);
        total += count_tokens(&tool.description);
        total += count_tokens(&tool.input_schema.to_string());
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NormalizedMessage, Role};

    #[test]
    fn empty_string_is_zero_tokens() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn concatenation_is_monotonic() {
        let a = "Hello there";
        let b = ", general Kenobi";
        let joined = format!("{}{}", a, b);
        let max = count_tokens(a).max(count_tokens(b));
        assert!(count_tokens(&joined) >= max);
    }

    #[test]
    fn request_counting_includes_overhead() {
        let request = NormalizedRequest {
            model: "claude-sonnet-4".into(),
            original_model: None,
            stream: false,
            system: None,
            messages: vec![NormalizedMessage {
                role: Role::User,
                content: "Hello".into(),
                tool_results: Vec::new(),
            }],
            tools: Vec::new(),
            max_tokens: None,
        };
        let count = count_request_tokens(&request);
        assert!(count >= PER_MESSAGE_OVERHEAD + 1);
        assert!(count <= PER_MESSAGE_OVERHEAD + 10);
    }
}
