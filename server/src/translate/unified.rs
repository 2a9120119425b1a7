//! Unified SSE translator: the Anthropic event grammar serialized as
//! data-only frames with self-describing `type` fields.

use serde_json::Value;

use super::anthropic::{MessageMachine, Wire};
use super::TranslateError;
use crate::eventstream::UpstreamEvent;

pub struct UnifiedStream {
    inner: MessageMachine,
}

impl UnifiedStream {
    pub fn new(message_id: String, model: String, input_tokens: u32, strict: bool) -> Self {
        Self {
            inner: MessageMachine::new(message_id, model, input_tokens, strict, Wire::Unified),
        }
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> Result<String, TranslateError> {
        self.inner.on_event(event)
    }

    pub fn finish(&mut self) -> Result<String, TranslateError> {
        self.inner.finish()
    }

    pub fn final_message(&self) -> Value {
        self.inner.final_message()
    }

    pub fn output_tokens(&self) -> u32 {
        self.inner.output_tokens()
    }

    pub fn input_tokens(&self) -> u32 {
        self.inner.input_tokens()
    }

    pub fn ended(&self) -> bool {
        self.inner.ended()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventstream::{AssistantResponsePayload, InitialResponsePayload};

    #[test]
    fn frames_are_data_only() {
        let mut t = UnifiedStream::new("msg_u".into(), "claude-sonnet-4".into(), 2, false);
        let mut out = String::new();
        out.push_str(
            &t.on_event(&UpstreamEvent::InitialResponse(InitialResponsePayload::default()))
                .unwrap(),
        );
        out.push_str(
            &t.on_event(&UpstreamEvent::AssistantResponse(AssistantResponsePayload {
                content: "hi".into(),
            }))
            .unwrap(),
        );
        out.push_str(&t.on_event(&UpstreamEvent::ResponseEnd).unwrap());

        assert!(!out.contains("event: "));
        let types: Vec<String> = out
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| {
                let payload: serde_json::Value =
                    serde_json::from_str(f.strip_prefix("data: ").unwrap()).unwrap();
                payload["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }
}
