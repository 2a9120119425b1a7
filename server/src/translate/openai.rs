//! OpenAI `chat.completion.chunk` translator.
//!
//! Emits `data: {...}\n\n` frames and a terminating `data: [DONE]\n\n`.
//! Thinking runs surface as `reasoning_content` deltas; tool calls stream
//! as `tool_calls` deltas with string-fragment arguments.

use serde_json::{json, Value};
use std::collections::HashMap;

use super::{
    aggregator::ToolJsonAggregator,
    thinking::{RunKind, ThinkScanner},
    TranslateError, TranslatorCore,
};
use crate::eventstream::UpstreamEvent;

pub struct OpenAiStream {
    core: TranslatorCore,
    scanner: ThinkScanner,
    agg: ToolJsonAggregator,
    created: i64,
    started: bool,
    ended: bool,
    done_sent: bool,
    /// OpenAI tool_calls array position per tool-use id.
    tool_positions: HashMap<String, usize>,
}

impl OpenAiStream {
    pub fn new(message_id: String, model: String, input_tokens: u32) -> Self {
        Self {
            core: TranslatorCore::new(message_id, model, input_tokens),
            scanner: ThinkScanner::new(),
            agg: ToolJsonAggregator::new(),
            created: chrono::Utc::now().timestamp(),
            started: false,
            ended: false,
            done_sent: false,
            tool_positions: HashMap::new(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> String {
        let mut body = json!({
            "id": self.core.message_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.core.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        format!("data: {}\n\n", body)
    }

    fn usage_json(&self) -> Value {
        let completion = self.core.final_output_tokens(&self.agg.all_inputs_text());
        json!({
            "prompt_tokens": self.core.input_tokens,
            "completion_tokens": completion,
            "total_tokens": self.core.input_tokens + completion,
        })
    }

    fn ensure_started(&mut self, out: &mut String) {
        if !self.started {
            self.started = true;
            out.push_str(&self.chunk(json!({"role": "assistant", "content": ""}), None, None));
        }
    }

    fn tool_position(&self, id: Option<&str>) -> Option<usize> {
        match id {
            Some(id) => self.tool_positions.get(id).copied(),
            None => self
                .agg
                .current_tool()
                .and_then(|(id, _)| self.tool_positions.get(id).copied()),
        }
    }

    pub fn on_event(&mut self, event: &UpstreamEvent) -> Result<String, TranslateError> {
        let mut out = String::new();
        if self.ended {
            return Ok(out);
        }

        match event {
            UpstreamEvent::InitialResponse(_) => self.ensure_started(&mut out),

            UpstreamEvent::AssistantResponse(payload) => {
                self.ensure_started(&mut out);
                for run in self.scanner.push(&payload.content) {
                    if run.text.is_empty() {
                        continue;
                    }
                    self.core.record_output(&run.text);
                    let delta = match run.kind {
                        RunKind::Text => {
                            self.core.accumulated_text.push_str(&run.text);
                            json!({"content": run.text})
                        }
                        RunKind::Thinking => {
                            self.core.accumulated_thinking.push_str(&run.text);
                            json!({"reasoning_content": run.text})
                        }
                    };
                    out.push_str(&self.chunk(delta, None, None));
                }
            }

            UpstreamEvent::ToolUse(payload) => {
                self.ensure_started(&mut out);
                if let (Some(id), Some(name)) = (&payload.tool_use_id, &payload.name) {
                    if self.agg.start(id, name) {
                        let position = self.tool_positions.len();
                        self.tool_positions.insert(id.clone(), position);
                        out.push_str(&self.chunk(
                            json!({"tool_calls": [{
                                "index": position,
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": ""},
                            }]}),
                            None,
                            None,
                        ));
                    }
                }

                if let Some(input) = &payload.input {
                    if let Some(delta) = self
                        .agg
                        .push_fragment(payload.tool_use_id.as_deref(), input.as_bytes())
                    {
                        if let Some(position) = self.tool_position(payload.tool_use_id.as_deref())
                        {
                            out.push_str(&self.chunk(
                                json!({"tool_calls": [{
                                    "index": position,
                                    "function": {"arguments": delta},
                                }]}),
                                None,
                                None,
                            ));
                        }
                    }
                }

                if payload.stop == Some(true) {
                    self.agg.stop(payload.tool_use_id.as_deref());
                }
            }

            UpstreamEvent::ResponseEnd => self.finish_stream(&mut out),

            UpstreamEvent::Metering(payload) => self.core.note_metering(payload),
            UpstreamEvent::ContextUsage(payload) => self.core.note_context(payload),
            UpstreamEvent::CodeReference(_) => {}
            UpstreamEvent::Exception { .. } => {}
        }
        Ok(out)
    }

    fn finish_stream(&mut self, out: &mut String) {
        if self.ended {
            return;
        }
        self.ensure_started(out);
        if let Some(run) = self.scanner.finish() {
            if !run.text.is_empty() {
                self.core.record_output(&run.text);
                let delta = match run.kind {
                    RunKind::Text => {
                        self.core.accumulated_text.push_str(&run.text);
                        json!({"content": run.text})
                    }
                    RunKind::Thinking => {
                        self.core.accumulated_thinking.push_str(&run.text);
                        json!({"reasoning_content": run.text})
                    }
                };
                out.push_str(&self.chunk(delta, None, None));
            }
        }
        let usage = self.usage_json();
        out.push_str(&self.chunk(json!({}), Some(self.finish_reason()), Some(usage)));
        self.ended = true;
    }

    /// Close the stream (synthesizing the final chunk if the upstream
    /// never ended) and emit the `[DONE]` sentinel.
    pub fn finish(&mut self) -> Result<String, TranslateError> {
        let mut out = String::new();
        self.finish_stream(&mut out);
        if !self.done_sent {
            self.done_sent = true;
            out.push_str("data: [DONE]\n\n");
        }
        Ok(out)
    }

    pub fn finish_reason(&self) -> &'static str {
        if self.agg.any_started() {
            "tool_calls"
        } else {
            "stop"
        }
    }

    pub fn output_tokens(&self) -> u32 {
        self.core.final_output_tokens(&self.agg.all_inputs_text())
    }

    pub fn input_tokens(&self) -> u32 {
        self.core.input_tokens
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Buffered single-response body for the non-streaming path.
    pub fn final_response(&self) -> Value {
        let mut message = json!({"role": "assistant"});
        message["content"] = if self.core.accumulated_text.is_empty() {
            Value::Null
        } else {
            json!(self.core.accumulated_text)
        };
        if !self.core.accumulated_thinking.is_empty() {
            message["reasoning_content"] = json!(self.core.accumulated_thinking);
        }
        if self.agg.any_started() {
            message["tool_calls"] = json!(self
                .agg
                .tools()
                .iter()
                .map(|tool| json!({
                    "id": tool.id,
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "arguments": tool.input().to_string(),
                    },
                }))
                .collect::<Vec<_>>());
        }
        json!({
            "id": self.core.message_id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.core.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": self.finish_reason(),
            }],
            "usage": self.usage_json(),
        })
    }
}
