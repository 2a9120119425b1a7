//! Anthropic-grammar stream machine and the Anthropic SSE translator.
//!
//! [`MessageMachine`] drives the full event grammar (`message_start`,
//! `content_block_*`, `message_delta`, `message_stop`) from upstream
//! events; the Anthropic and unified translators differ only in wire
//! framing, so both wrap the same machine.

use serde_json::{json, Value};
use std::collections::HashMap;

use super::{
    aggregator::ToolJsonAggregator,
    state::{BlockKind, DeltaPayload, SseEvent, SseStateManager},
    thinking::{Run, RunKind, ThinkScanner},
    TranslateError, TranslatorCore,
};
use crate::eventstream::UpstreamEvent;

/// Wire framing for the Anthropic-grammar variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wire {
    Anthropic,
    Unified,
}

pub(crate) struct MessageMachine {
    core: TranslatorCore,
    state: SseStateManager,
    scanner: ThinkScanner,
    agg: ToolJsonAggregator,
    wire: Wire,
    /// Monotonic content-block index; starts at -1 (no block yet).
    block_index: i32,
    open_block: Option<(i32, BlockKind)>,
    tool_indices: HashMap<String, i32>,
    ended: bool,
}

impl MessageMachine {
    pub(crate) fn new(
        message_id: String,
        model: String,
        input_tokens: u32,
        strict: bool,
        wire: Wire,
    ) -> Self {
        Self {
            core: TranslatorCore::new(message_id, model, input_tokens),
            state: SseStateManager::new(strict),
            scanner: ThinkScanner::new(),
            agg: ToolJsonAggregator::new(),
            wire,
            block_index: -1,
            open_block: None,
            tool_indices: HashMap::new(),
            ended: false,
        }
    }

    fn serialize(&self, event: &SseEvent) -> String {
        match self.wire {
            Wire::Anthropic => event.to_anthropic_sse(),
            Wire::Unified => event.to_unified_sse(),
        }
    }

    /// Run an event through the state guard and serialize whatever it
    /// lets through, keeping the open-block tracker aligned with any
    /// repair events the guard injected.
    fn emit(&mut self, event: SseEvent, out: &mut String) -> Result<(), TranslateError> {
        for passed in self.state.apply(event)? {
            match &passed {
                SseEvent::ContentBlockStart { index, kind, .. } => {
                    self.open_block = Some((*index, *kind));
                }
                SseEvent::ContentBlockStop { index } => {
                    if matches!(self.open_block, Some((open, _)) if open == *index) {
                        self.open_block = None;
                    }
                }
                _ => {}
            }
            out.push_str(&self.serialize(&passed));
        }
        Ok(())
    }

    fn ensure_started(&mut self, out: &mut String) -> Result<(), TranslateError> {
        if self.state.message_started() {
            return Ok(());
        }
        self.emit(
            SseEvent::MessageStart {
                message_id: self.core.message_id.clone(),
                model: self.core.model.clone(),
                input_tokens: self.core.input_tokens,
            },
            out,
        )?;
        self.emit(SseEvent::Ping, out)
    }

    fn emit_run(&mut self, run: Run, out: &mut String) -> Result<(), TranslateError> {
        if run.text.is_empty() {
            return Ok(());
        }
        let kind = match run.kind {
            RunKind::Text => BlockKind::Text,
            RunKind::Thinking => BlockKind::Thinking,
        };

        let index = match self.open_block {
            Some((index, open_kind)) if open_kind == kind => index,
            other => {
                if let Some((index, _)) = other {
                    self.emit(SseEvent::ContentBlockStop { index }, out)?;
                }
                self.block_index += 1;
                let index = self.block_index;
                self.emit(
                    SseEvent::ContentBlockStart {
                        index,
                        kind,
                        tool_use_id: None,
                        tool_name: None,
                    },
                    out,
                )?;
                index
            }
        };

        self.core.record_output(&run.text);
        let delta = match kind {
            BlockKind::Text => {
                self.core.accumulated_text.push_str(&run.text);
                DeltaPayload::Text(run.text)
            }
            BlockKind::Thinking => {
                self.core.accumulated_thinking.push_str(&run.text);
                DeltaPayload::Thinking(run.text)
            }
            BlockKind::ToolUse => unreachable!("runs are text or thinking"),
        };
        self.emit(SseEvent::ContentBlockDelta { index, delta }, out)
    }

    fn tool_index_for(&self, id: Option<&str>) -> Option<i32> {
        match id {
            Some(id) => self.tool_indices.get(id).copied(),
            None => self
                .agg
                .current_tool()
                .and_then(|(id, _)| self.tool_indices.get(id).copied()),
        }
    }

    pub(crate) fn on_event(&mut self, event: &UpstreamEvent) -> Result<String, TranslateError> {
        let mut out = String::new();
        // Everything after assistantResponseEnd is dropped.
        if self.ended {
            return Ok(out);
        }

        match event {
            UpstreamEvent::InitialResponse(_) => {
                // The upstream conversation id may be empty or duplicated;
                // the message id stays caller-supplied.
                self.ensure_started(&mut out)?;
            }

            UpstreamEvent::AssistantResponse(payload) => {
                self.ensure_started(&mut out)?;
                if let Some((index, BlockKind::ToolUse)) = self.open_block {
                    self.emit(SseEvent::ContentBlockStop { index }, &mut out)?;
                }
                for run in self.scanner.push(&payload.content) {
                    self.emit_run(run, &mut out)?;
                }
            }

            UpstreamEvent::ToolUse(payload) => {
                self.ensure_started(&mut out)?;
                if let (Some(id), Some(name)) = (&payload.tool_use_id, &payload.name) {
                    if self.agg.start(id, name) {
                        if let Some((index, _)) = self.open_block {
                            self.emit(SseEvent::ContentBlockStop { index }, &mut out)?;
                        }
                        self.block_index += 1;
                        let index = self.block_index;
                        self.tool_indices.insert(id.clone(), index);
                        self.emit(
                            SseEvent::ContentBlockStart {
                                index,
                                kind: BlockKind::ToolUse,
                                tool_use_id: Some(id.clone()),
                                tool_name: Some(name.clone()),
                            },
                            &mut out,
                        )?;
                    }
                }

                if let Some(input) = &payload.input {
                    if let Some(delta) = self
                        .agg
                        .push_fragment(payload.tool_use_id.as_deref(), input.as_bytes())
                    {
                        if let Some(index) = self.tool_index_for(payload.tool_use_id.as_deref()) {
                            self.emit(
                                SseEvent::ContentBlockDelta {
                                    index,
                                    delta: DeltaPayload::InputJson(delta),
                                },
                                &mut out,
                            )?;
                        }
                    }
                }

                if payload.stop == Some(true) {
                    if let Some((id, _input)) = self.agg.stop(payload.tool_use_id.as_deref()) {
                        if let Some(index) = self.tool_indices.get(&id).copied() {
                            self.emit(SseEvent::ContentBlockStop { index }, &mut out)?;
                        }
                    }
                }
            }

            UpstreamEvent::ResponseEnd => self.finish_message(&mut out)?,

            UpstreamEvent::Metering(payload) => self.core.note_metering(payload),
            UpstreamEvent::ContextUsage(payload) => self.core.note_context(payload),
            UpstreamEvent::CodeReference(_) => {}

            // Exceptions are classified by the coordinator before the
            // translator sees the stream; nothing to forward here.
            UpstreamEvent::Exception { .. } => {}
        }
        Ok(out)
    }

    fn finish_message(&mut self, out: &mut String) -> Result<(), TranslateError> {
        if self.ended {
            return Ok(());
        }
        self.ensure_started(out)?;
        // A partial tag held at stream end was ordinary text.
        if let Some(run) = self.scanner.finish() {
            self.emit_run(run, out)?;
        }
        if let Some((index, _)) = self.open_block {
            self.emit(SseEvent::ContentBlockStop { index }, out)?;
        }
        let output_tokens = self.output_tokens();
        self.emit(
            SseEvent::MessageDelta {
                stop_reason: self.stop_reason().to_string(),
                output_tokens,
            },
            out,
        )?;
        self.emit(SseEvent::MessageStop, out)?;
        self.ended = true;
        Ok(())
    }

    /// Close the stream if the upstream never sent assistantResponseEnd.
    pub(crate) fn finish(&mut self) -> Result<String, TranslateError> {
        let mut out = String::new();
        self.finish_message(&mut out)?;
        Ok(out)
    }

    pub(crate) fn stop_reason(&self) -> &'static str {
        if self.agg.any_started() {
            "tool_use"
        } else {
            "end_turn"
        }
    }

    pub(crate) fn output_tokens(&self) -> u32 {
        self.core.final_output_tokens(&self.agg.all_inputs_text())
    }

    pub(crate) fn input_tokens(&self) -> u32 {
        self.core.input_tokens
    }

    pub(crate) fn ended(&self) -> bool {
        self.ended
    }

    /// Buffered single-message body for the non-streaming path.
    pub(crate) fn final_message(&self) -> Value {
        let mut content = Vec::new();
        if !self.core.accumulated_thinking.is_empty() {
            content.push(json!({
                "type": "thinking",
                "thinking": self.core.accumulated_thinking,
                "signature": "",
            }));
        }
        if !self.core.accumulated_text.is_empty() {
            content.push(json!({"type": "text", "text": self.core.accumulated_text}));
        }
        for tool in self.agg.tools() {
            content.push(json!({
                "type": "tool_use",
                "id": tool.id,
                "name": tool.name,
                "input": tool.input(),
            }));
        }
        json!({
            "id": self.core.message_id,
            "type": "message",
            "role": "assistant",
            "model": self.core.model,
            "content": content,
            "stop_reason": self.stop_reason(),
            "stop_sequence": null,
            "usage": {
                "input_tokens": self.core.input_tokens,
                "output_tokens": self.output_tokens(),
            },
        })
    }
}

/// Translator emitting the Anthropic SSE grammar with named events.
pub struct AnthropicStream {
    inner: MessageMachine,
}

impl AnthropicStream {
    pub fn new(message_id: String, model: String, input_tokens: u32, strict: bool) -> Self {
        Self {
            inner: MessageMachine::new(message_id, model, input_tokens, strict, Wire::Anthropic),
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
    use crate::eventstream::{
        AssistantResponsePayload, InitialResponsePayload, ToolUsePayload, UpstreamEvent,
    };

    fn translator() -> AnthropicStream {
        AnthropicStream::new("msg_01".into(), "claude-sonnet-4".into(), 3, false)
    }

    fn initial() -> UpstreamEvent {
        UpstreamEvent::InitialResponse(InitialResponsePayload {
            conversation_id: Some("upstream-id".into()),
        })
    }

    fn content(text: &str) -> UpstreamEvent {
        UpstreamEvent::AssistantResponse(AssistantResponsePayload {
            content: text.to_string(),
        })
    }

    /// Split the SSE text into (event, data-json) pairs.
    fn parse_sse(out: &str) -> Vec<(String, serde_json::Value)> {
        out.split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let mut event = String::new();
                let mut data = serde_json::Value::Null;
                for line in frame.lines() {
                    if let Some(name) = line.strip_prefix("event: ") {
                        event = name.to_string();
                    } else if let Some(payload) = line.strip_prefix("data: ") {
                        data = serde_json::from_str(payload).unwrap();
                    }
                }
                (event, data)
            })
            .collect()
    }

    #[test]
    fn simple_text_stream() {
        let mut t = translator();
        let mut out = String::new();
        out.push_str(&t.on_event(&initial()).unwrap());
        out.push_str(&t.on_event(&content("Hello")).unwrap());
        out.push_str(&t.on_event(&content(" world")).unwrap());
        out.push_str(&t.on_event(&UpstreamEvent::ResponseEnd).unwrap());

        let frames = parse_sse(&out);
        let names: Vec<&str> = frames.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        // message id is caller-supplied, not the upstream conversation id
        assert_eq!(frames[0].1["message"]["id"], "msg_01");
        assert_eq!(frames[0].1["message"]["usage"]["input_tokens"], 3);
        assert_eq!(frames[6].1["delta"]["stop_reason"], "end_turn");
        assert!(t.ended());
    }

    #[test]
    fn events_after_end_are_dropped() {
        let mut t = translator();
        t.on_event(&initial()).unwrap();
        t.on_event(&UpstreamEvent::ResponseEnd).unwrap();
        assert!(t.on_event(&content("late")).unwrap().is_empty());
    }

    #[test]
    fn tool_use_with_fragmented_input() {
        // start, three input fragments, stop, end
        let mut t = translator();
        let mut out = String::new();
        out.push_str(&t.on_event(&initial()).unwrap());
        out.push_str(
            &t.on_event(&UpstreamEvent::ToolUse(ToolUsePayload {
                tool_use_id: Some("t1".into()),
                name: Some("read_file".into()),
                input: None,
                stop: None,
            }))
            .unwrap(),
        );
        for fragment in [r#"{"path":""#, "/tmp/a", r#""}"#] {
            out.push_str(
                &t.on_event(&UpstreamEvent::ToolUse(ToolUsePayload {
                    tool_use_id: None,
                    name: None,
                    input: Some(fragment.to_string()),
                    stop: None,
                }))
                .unwrap(),
            );
        }
        out.push_str(
            &t.on_event(&UpstreamEvent::ToolUse(ToolUsePayload {
                tool_use_id: None,
                name: None,
                input: None,
                stop: Some(true),
            }))
            .unwrap(),
        );
        out.push_str(&t.on_event(&UpstreamEvent::ResponseEnd).unwrap());

        let frames = parse_sse(&out);
        let names: Vec<&str> = frames.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let start = &frames[2].1;
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["id"], "t1");
        assert_eq!(start["content_block"]["name"], "read_file");

        let joined: String = frames
            .iter()
            .filter(|(e, _)| e == "content_block_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap())
            .collect();
        assert_eq!(joined, r#"{"path":"/tmp/a"}"#);
        assert_eq!(frames[7].1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn duplicate_tool_start_is_deduplicated() {
        let mut t = translator();
        t.on_event(&initial()).unwrap();
        let start = ToolUsePayload {
            tool_use_id: Some("t1".into()),
            name: Some("read_file".into()),
            input: None,
            stop: None,
        };
        let first = t.on_event(&UpstreamEvent::ToolUse(start.clone())).unwrap();
        let second = t.on_event(&UpstreamEvent::ToolUse(start)).unwrap();
        assert!(first.contains("content_block_start"));
        assert!(second.is_empty());
    }

    #[test]
    fn thinking_tag_split_across_chunks() {
        let mut t = translator();
        let mut out = String::new();
        out.push_str(&t.on_event(&initial()).unwrap());
        out.push_str(&t.on_event(&content("Hello <thi")).unwrap());
        out.push_str(&t.on_event(&content("nking>secret</thinking> world")).unwrap());
        out.push_str(&t.on_event(&UpstreamEvent::ResponseEnd).unwrap());

        let frames = parse_sse(&out);

        let texts: String = frames
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "text_delta")
            .map(|(_, d)| d["delta"]["text"].as_str().unwrap())
            .collect();
        let thinking: String = frames
            .iter()
            .filter(|(e, d)| e == "content_block_delta" && d["delta"]["type"] == "thinking_delta")
            .map(|(_, d)| d["delta"]["thinking"].as_str().unwrap())
            .collect();
        assert_eq!(texts, "Hello  world");
        assert_eq!(thinking, "secret");
        assert!(!texts.contains('<'));

        // block framing: text(0) start/stop, thinking(1) start/stop, text(2) start/stop
        let starts: Vec<i64> = frames
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["index"].as_i64().unwrap())
            .collect();
        let stops: Vec<i64> = frames
            .iter()
            .filter(|(e, _)| e == "content_block_stop")
            .map(|(_, d)| d["index"].as_i64().unwrap())
            .collect();
        assert_eq!(starts, vec![0, 1, 2]);
        assert_eq!(stops, vec![0, 1, 2]);
        let start_types: Vec<&str> = frames
            .iter()
            .filter(|(e, _)| e == "content_block_start")
            .map(|(_, d)| d["content_block"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(start_types, vec!["text", "thinking", "text"]);
    }

    #[test]
    fn text_after_tool_closes_the_tool_block() {
        let mut t = translator();
        t.on_event(&initial()).unwrap();
        t.on_event(&UpstreamEvent::ToolUse(ToolUsePayload {
            tool_use_id: Some("t1".into()),
            name: Some("calc".into()),
            input: Some("{}".into()),
            stop: None,
        }))
        .unwrap();
        let out = t.on_event(&content("and the answer is")).unwrap();
        let frames = parse_sse(&out);
        assert_eq!(frames[0].0, "content_block_stop");
        assert_eq!(frames[0].1["index"], 0);
        assert_eq!(frames[1].0, "content_block_start");
        assert_eq!(frames[1].1["index"], 1);
    }

    #[test]
    fn finish_without_response_end_synthesizes_closure() {
        let mut t = translator();
        t.on_event(&initial()).unwrap();
        t.on_event(&content("partial answer")).unwrap();
        let out = t.finish().unwrap();
        assert!(out.contains("message_delta"));
        assert!(out.contains("message_stop"));
        assert!(t.ended());
    }

    #[test]
    fn non_stream_final_message_shape() {
        let mut t = translator();
        t.on_event(&initial()).unwrap();
        t.on_event(&content("<thinking>hmm</thinking>Hello")).unwrap();
        t.on_event(&UpstreamEvent::ToolUse(ToolUsePayload {
            tool_use_id: Some("t1".into()),
            name: Some("calc".into()),
            input: Some(r#"{"x":1}"#.into()),
            stop: Some(true),
        }))
        .unwrap();
        t.on_event(&UpstreamEvent::ResponseEnd).unwrap();

        let message = t.final_message();
        assert_eq!(message["id"], "msg_01");
        assert_eq!(message["stop_reason"], "tool_use");
        let content = message["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "thinking");
        assert_eq!(content[0]["thinking"], "hmm");
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], "Hello");
        assert_eq!(content[2]["type"], "tool_use");
        assert_eq!(content[2]["input"]["x"], 1);
        assert!(message["usage"]["output_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn metering_and_context_events_are_consumed_silently() {
        let mut t = translator();
        t.on_event(&initial()).unwrap();
        let out = t
            .on_event(&UpstreamEvent::Metering(crate::eventstream::MeteringPayload {
                usage: Some(1.0),
            }))
            .unwrap();
        assert!(out.is_empty());
        let out = t
            .on_event(&UpstreamEvent::ContextUsage(
                crate::eventstream::ContextUsagePayload {
                    percentage: Some(12.5),
                },
            ))
            .unwrap();
        assert!(out.is_empty());
    }
}
