//! Event-ordering guard for the Anthropic-grammar SSE stream.
//!
//! Every event a translator wants to emit passes through
//! [`SseStateManager::apply`], which returns the possibly repaired event
//! sequence to actually write. In non-strict mode (the default) grammar
//! violations are repaired and logged; in strict mode they fail the
//! stream.

use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaPayload {
    Text(String),
    Thinking(String),
    InputJson(String),
}

impl DeltaPayload {
    pub fn kind(&self) -> BlockKind {
        match self {
            DeltaPayload::Text(_) => BlockKind::Text,
            DeltaPayload::Thinking(_) => BlockKind::Thinking,
            DeltaPayload::InputJson(_) => BlockKind::ToolUse,
        }
    }
}

/// One event of the Anthropic streaming grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    MessageStart {
        message_id: String,
        model: String,
        input_tokens: u32,
    },
    Ping,
    ContentBlockStart {
        index: i32,
        kind: BlockKind,
        tool_use_id: Option<String>,
        tool_name: Option<String>,
    },
    ContentBlockDelta {
        index: i32,
        delta: DeltaPayload,
    },
    ContentBlockStop {
        index: i32,
    },
    MessageDelta {
        stop_reason: String,
        output_tokens: u32,
    },
    MessageStop,
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("duplicate message_start")]
    DuplicateMessageStart,

    #[error("content_block_delta for index {0} with no prior content_block_start")]
    DeltaWithoutStart(i32),

    #[error("content_block_delta for stopped index {0}")]
    DeltaAfterStop(i32),

    #[error("duplicate content_block_start for index {0}")]
    DuplicateBlockStart(i32),

    #[error("content_block_stop for index {0} with no open block")]
    StopWithoutStart(i32),

    #[error("duplicate message_delta")]
    DuplicateMessageDelta,

    #[error("duplicate message_stop")]
    DuplicateMessageStop,
}

#[derive(Debug, Clone)]
struct BlockState {
    kind: BlockKind,
    stopped: bool,
    tool_use_id: Option<String>,
    tool_name: Option<String>,
}

/// Tracks stream position and repairs (or rejects) grammar violations.
pub struct SseStateManager {
    strict: bool,
    message_start_sent: bool,
    message_delta_sent: bool,
    message_stop_sent: bool,
    blocks: BTreeMap<i32, BlockState>,
}

impl SseStateManager {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            message_start_sent: false,
            message_delta_sent: false,
            message_stop_sent: false,
            blocks: BTreeMap::new(),
        }
    }

    pub fn message_started(&self) -> bool {
        self.message_start_sent
    }

    /// Run one event through the guard. The returned vector is what the
    /// caller writes, in order; it may be empty (event dropped), the
    /// event alone, or repair events followed by the event.
    pub fn apply(&mut self, event: SseEvent) -> Result<Vec<SseEvent>, StateError> {
        match event {
            SseEvent::MessageStart { .. } => {
                if self.message_start_sent {
                    return self.violation(StateError::DuplicateMessageStart);
                }
                self.message_start_sent = true;
                Ok(vec![event])
            }

            SseEvent::Ping => Ok(vec![event]),

            SseEvent::ContentBlockStart {
                index,
                kind,
                ref tool_use_id,
                ref tool_name,
            } => {
                if let Some(existing) = self.blocks.get(&index) {
                    if !existing.stopped {
                        return self.violation(StateError::DuplicateBlockStart(index));
                    }
                }
                let mut out = Vec::new();
                // Tool and text blocks never interleave: starting a tool
                // block force-closes an open text block. Thinking blocks
                // are left open (they may reopen later).
                if kind == BlockKind::ToolUse {
                    out.extend(self.close_open_blocks(|k| k == BlockKind::Text));
                }
                self.blocks.insert(
                    index,
                    BlockState {
                        kind,
                        stopped: false,
                        tool_use_id: tool_use_id.clone(),
                        tool_name: tool_name.clone(),
                    },
                );
                out.push(event);
                Ok(out)
            }

            SseEvent::ContentBlockDelta { index, ref delta } => {
                match self.blocks.get_mut(&index) {
                    None => {
                        if self.strict {
                            return Err(StateError::DeltaWithoutStart(index));
                        }
                        // Synthesize the start the upstream never sent,
                        // inferring the block type from the delta kind.
                        warn!(index, "synthesizing content_block_start for orphan delta");
                        let kind = delta.kind();
                        self.blocks.insert(
                            index,
                            BlockState {
                                kind,
                                stopped: false,
                                tool_use_id: None,
                                tool_name: None,
                            },
                        );
                        Ok(vec![
                            SseEvent::ContentBlockStart {
                                index,
                                kind,
                                tool_use_id: None,
                                tool_name: None,
                            },
                            event,
                        ])
                    }
                    Some(block) if block.stopped => {
                        if self.strict {
                            return Err(StateError::DeltaAfterStop(index));
                        }
                        if block.kind == BlockKind::Thinking {
                            // Thinking blocks reopen in place.
                            warn!(index, "reopening stopped thinking block");
                            block.stopped = false;
                            Ok(vec![event])
                        } else {
                            warn!(index, "re-starting stopped block for late delta");
                            block.stopped = false;
                            let start = SseEvent::ContentBlockStart {
                                index,
                                kind: block.kind,
                                tool_use_id: block.tool_use_id.clone(),
                                tool_name: block.tool_name.clone(),
                            };
                            Ok(vec![start, event])
                        }
                    }
                    Some(_) => Ok(vec![event]),
                }
            }

            SseEvent::ContentBlockStop { index } => match self.blocks.get_mut(&index) {
                Some(block) if !block.stopped => {
                    block.stopped = true;
                    Ok(vec![event])
                }
                _ => self.violation(StateError::StopWithoutStart(index)),
            },

            SseEvent::MessageDelta { .. } => {
                if self.message_delta_sent {
                    return self.violation(StateError::DuplicateMessageDelta);
                }
                self.message_delta_sent = true;
                let mut out = self.close_open_blocks(|k| k != BlockKind::Thinking);
                out.push(event);
                Ok(out)
            }

            SseEvent::MessageStop => {
                if self.message_stop_sent {
                    return self.violation(StateError::DuplicateMessageStop);
                }
                self.message_stop_sent = true;
                Ok(vec![event])
            }
        }
    }

    /// Emit stops for open blocks matching the predicate.
    fn close_open_blocks(&mut self, matches: impl Fn(BlockKind) -> bool) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for (&index, block) in self.blocks.iter_mut() {
            if !block.stopped && matches(block.kind) {
                block.stopped = true;
                out.push(SseEvent::ContentBlockStop { index });
            }
        }
        out
    }

    fn violation(&self, err: StateError) -> Result<Vec<SseEvent>, StateError> {
        if self.strict {
            Err(err)
        } else {
            warn!(violation = %err, "dropping out-of-order SSE event");
            Ok(Vec::new())
        }
    }
}

// =============================================================================
// Wire serialization
// =============================================================================

impl SseEvent {
    fn payload(&self) -> serde_json::Value {
        match self {
            SseEvent::MessageStart {
                message_id,
                model,
                input_tokens,
            } => json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0},
                }
            }),
            SseEvent::Ping => json!({"type": "ping"}),
            SseEvent::ContentBlockStart {
                index,
                kind,
                tool_use_id,
                tool_name,
            } => {
                let content_block = match kind {
                    BlockKind::Text => json!({"type": "text", "text": ""}),
                    // thinking starts always carry a signature field
                    BlockKind::Thinking => {
                        json!({"type": "thinking", "thinking": "", "signature": ""})
                    }
                    BlockKind::ToolUse => json!({
                        "type": "tool_use",
                        "id": tool_use_id.clone().unwrap_or_default(),
                        "name": tool_name.clone().unwrap_or_default(),
                        "input": {},
                    }),
                };
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": content_block,
                })
            }
            SseEvent::ContentBlockDelta { index, delta } => {
                let delta_json = match delta {
                    DeltaPayload::Text(text) => json!({"type": "text_delta", "text": text}),
                    DeltaPayload::Thinking(text) => {
                        json!({"type": "thinking_delta", "thinking": text})
                    }
                    DeltaPayload::InputJson(partial) => {
                        json!({"type": "input_json_delta", "partial_json": partial})
                    }
                };
                json!({"type": "content_block_delta", "index": index, "delta": delta_json})
            }
            SseEvent::ContentBlockStop { index } => {
                json!({"type": "content_block_stop", "index": index})
            }
            SseEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens},
            }),
            SseEvent::MessageStop => json!({"type": "message_stop"}),
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            SseEvent::MessageStart { .. } => "message_start",
            SseEvent::Ping => "ping",
            SseEvent::ContentBlockStart { .. } => "content_block_start",
            SseEvent::ContentBlockDelta { .. } => "content_block_delta",
            SseEvent::ContentBlockStop { .. } => "content_block_stop",
            SseEvent::MessageDelta { .. } => "message_delta",
            SseEvent::MessageStop => "message_stop",
        }
    }

    /// Named-event framing used by the Anthropic surface.
    pub fn to_anthropic_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.payload())
    }

    /// Data-only framing used by the unified surface; the payload is
    /// self-describing through its `type` field.
    pub fn to_unified_sse(&self) -> String {
        format!("data: {}\n\n", self.payload())
    }
}

/// Anthropic-protocol SSE error frame.
pub fn anthropic_error_frame(message: &str) -> String {
    format!(
        "event: error\ndata: {}\n\n",
        json!({"type": "error", "error": {"type": "api_error", "message": message}})
    )
}

/// Unified-protocol SSE error frame.
pub fn unified_error_frame(message: &str) -> String {
    format!(
        "event: error\ndata: {}\n\n",
        json!({"type": "error", "message": message})
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event() -> SseEvent {
        SseEvent::MessageStart {
            message_id: "msg_1".into(),
            model: "claude-sonnet-4".into(),
            input_tokens: 3,
        }
    }

    #[test]
    fn duplicate_message_start_dropped_when_lenient() {
        let mut state = SseStateManager::new(false);
        assert_eq!(state.apply(start_event()).unwrap().len(), 1);
        assert!(state.apply(start_event()).unwrap().is_empty());
    }

    #[test]
    fn duplicate_message_start_fails_strict() {
        let mut state = SseStateManager::new(true);
        state.apply(start_event()).unwrap();
        assert_eq!(
            state.apply(start_event()).unwrap_err(),
            StateError::DuplicateMessageStart
        );
    }

    #[test]
    fn orphan_delta_synthesizes_start_of_inferred_kind() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        let out = state
            .apply(SseEvent::ContentBlockDelta {
                index: 0,
                delta: DeltaPayload::Thinking("hm".into()),
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Thinking,
                ..
            }
        ));
    }

    #[test]
    fn orphan_delta_fails_strict() {
        let mut state = SseStateManager::new(true);
        state.apply(start_event()).unwrap();
        let err = state
            .apply(SseEvent::ContentBlockDelta {
                index: 0,
                delta: DeltaPayload::Text("x".into()),
            })
            .unwrap_err();
        assert_eq!(err, StateError::DeltaWithoutStart(0));
    }

    #[test]
    fn tool_start_closes_open_text_block() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        state
            .apply(SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
                tool_use_id: None,
                tool_name: None,
            })
            .unwrap();
        let out = state
            .apply(SseEvent::ContentBlockStart {
                index: 1,
                kind: BlockKind::ToolUse,
                tool_use_id: Some("t1".into()),
                tool_name: Some("read_file".into()),
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], SseEvent::ContentBlockStop { index: 0 });
        assert!(matches!(out[1], SseEvent::ContentBlockStart { index: 1, .. }));
    }

    #[test]
    fn tool_start_leaves_open_thinking_block_alone() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        state
            .apply(SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Thinking,
                tool_use_id: None,
                tool_name: None,
            })
            .unwrap();
        let out = state
            .apply(SseEvent::ContentBlockStart {
                index: 1,
                kind: BlockKind::ToolUse,
                tool_use_id: Some("t1".into()),
                tool_name: Some("read_file".into()),
            })
            .unwrap();
        // no auto-stop for the thinking block, just the tool start
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], SseEvent::ContentBlockStart { index: 1, .. }));
    }

    #[test]
    fn stopped_thinking_block_reopens_in_place() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        state
            .apply(SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Thinking,
                tool_use_id: None,
                tool_name: None,
            })
            .unwrap();
        state.apply(SseEvent::ContentBlockStop { index: 0 }).unwrap();
        let out = state
            .apply(SseEvent::ContentBlockDelta {
                index: 0,
                delta: DeltaPayload::Thinking("more".into()),
            })
            .unwrap();
        // no fresh start for thinking: the delta alone
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], SseEvent::ContentBlockDelta { .. }));
    }

    #[test]
    fn stopped_text_block_restarts_for_late_delta() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        state
            .apply(SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
                tool_use_id: None,
                tool_name: None,
            })
            .unwrap();
        state.apply(SseEvent::ContentBlockStop { index: 0 }).unwrap();
        let out = state
            .apply(SseEvent::ContentBlockDelta {
                index: 0,
                delta: DeltaPayload::Text("late".into()),
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
                ..
            }
        ));
    }

    #[test]
    fn message_delta_closes_open_non_thinking_blocks_and_is_unique() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        state
            .apply(SseEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
                tool_use_id: None,
                tool_name: None,
            })
            .unwrap();
        let out = state
            .apply(SseEvent::MessageDelta {
                stop_reason: "end_turn".into(),
                output_tokens: 5,
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], SseEvent::ContentBlockStop { index: 0 });

        let dup = state
            .apply(SseEvent::MessageDelta {
                stop_reason: "end_turn".into(),
                output_tokens: 5,
            })
            .unwrap();
        assert!(dup.is_empty());
    }

    #[test]
    fn message_stop_at_most_once() {
        let mut state = SseStateManager::new(false);
        state.apply(start_event()).unwrap();
        assert_eq!(state.apply(SseEvent::MessageStop).unwrap().len(), 1);
        assert!(state.apply(SseEvent::MessageStop).unwrap().is_empty());
    }

    #[test]
    fn thinking_start_serializes_with_signature() {
        let event = SseEvent::ContentBlockStart {
            index: 0,
            kind: BlockKind::Thinking,
            tool_use_id: None,
            tool_name: None,
        };
        let wire = event.to_anthropic_sse();
        assert!(wire.starts_with("event: content_block_start\n"));
        assert!(wire.contains(r#""signature":"""#));
    }

    #[test]
    fn unified_framing_is_data_only() {
        let wire = SseEvent::Ping.to_unified_sse();
        assert_eq!(wire, "data: {\"type\":\"ping\"}\n\n");
    }
}
