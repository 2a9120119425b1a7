//! Reassembly of tool-call JSON sharded across `toolUseEvent` fragments.
//!
//! The upstream slices tool input at arbitrary byte offsets, so a fragment
//! can end mid-codepoint. Each fragment is scanned from the back for a
//! multi-byte UTF-8 start whose continuation bytes are missing; that tail
//! is withheld and prepended to the next fragment, keeping every emitted
//! `partial_json` delta valid UTF-8. Only on `stop` is the accumulated
//! buffer parsed as JSON.

use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Per-tool accumulation state.
#[derive(Debug)]
pub struct ToolState {
    pub id: String,
    pub name: String,
    buf: Vec<u8>,
    pending: Vec<u8>,
    pub stopped: bool,
    parsed: Option<Value>,
}

impl ToolState {
    /// The parsed input; `{}` until `stop` has been processed.
    pub fn input(&self) -> Value {
        self.parsed.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Raw accumulated input text (for fallback token counting).
    fn input_text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Number of trailing bytes that begin a multi-byte UTF-8 sequence whose
/// continuation has not arrived yet.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let start = len.saturating_sub(3);
    for i in (start..len).rev() {
        let b = bytes[i];
        if b < 0x80 {
            return 0; // ASCII: everything after is complete
        }
        if b < 0xC0 {
            continue; // continuation byte, keep scanning for the lead
        }
        let need = if b >= 0xF0 {
            4
        } else if b >= 0xE0 {
            3
        } else {
            2
        };
        let have = len - i;
        return if have < need { have } else { 0 };
    }
    0
}

#[derive(Debug, Default)]
pub struct ToolJsonAggregator {
    tools: Vec<ToolState>,
    index_by_id: HashMap<String, usize>,
    /// Most recently started tool; orphan fragments inherit its id.
    current: Option<usize>,
}

impl ToolJsonAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool use. Returns false (and changes nothing) for a
    /// duplicate id.
    pub fn start(&mut self, id: &str, name: &str) -> bool {
        if self.index_by_id.contains_key(id) {
            return false;
        }
        let index = self.tools.len();
        self.tools.push(ToolState {
            id: id.to_string(),
            name: name.to_string(),
            buf: Vec::new(),
            pending: Vec::new(),
            stopped: false,
            parsed: None,
        });
        self.index_by_id.insert(id.to_string(), index);
        self.current = Some(index);
        true
    }

    fn resolve(&self, id: Option<&str>) -> Option<usize> {
        match id {
            Some(id) => self.index_by_id.get(id).copied(),
            None => self.current,
        }
    }

    /// Append an input fragment. Returns the UTF-8-complete delta to
    /// forward downstream, or `None` if the whole fragment is still a
    /// pending tail (or there is no tool to attach it to).
    pub fn push_fragment(&mut self, id: Option<&str>, fragment: &[u8]) -> Option<String> {
        let Some(index) = self.resolve(id) else {
            warn!("dropping tool input fragment with no matching tool use");
            return None;
        };
        let tool = &mut self.tools[index];

        let mut combined = std::mem::take(&mut tool.pending);
        combined.extend_from_slice(fragment);

        let tail = incomplete_tail_len(&combined);
        let split = combined.len() - tail;
        tool.pending = combined.split_off(split);
        if combined.is_empty() {
            return None;
        }

        tool.buf.extend_from_slice(&combined);
        match String::from_utf8(combined) {
            Ok(delta) => Some(delta),
            Err(e) => {
                // Invalid bytes in the middle of a fragment; forward
                // lossily so the delta stream stays aligned.
                warn!(error = %e, "tool input fragment is not valid UTF-8");
                Some(String::from_utf8_lossy(e.as_bytes()).into_owned())
            }
        }
    }

    /// Mark the tool finished and parse its accumulated input. An empty
    /// buffer is a legitimate zero-argument call; a non-empty buffer that
    /// fails to parse degrades to `{}` with a log line.
    pub fn stop(&mut self, id: Option<&str>) -> Option<(String, Value)> {
        let index = self.resolve(id)?;
        let tool = &mut self.tools[index];
        if tool.stopped {
            return Some((tool.id.clone(), tool.input()));
        }
        tool.stopped = true;

        // Whatever tail never completed still belongs to the buffer.
        let pending = std::mem::take(&mut tool.pending);
        tool.buf.extend_from_slice(&pending);

        let parsed = if tool.buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_slice::<Value>(&tool.buf) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        tool_use_id = %tool.id,
                        error = %e,
                        "tool input did not parse as JSON, substituting empty object"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        tool.parsed = Some(parsed.clone());
        Some((tool.id.clone(), parsed))
    }

    /// Id and name of the most recently started tool.
    pub fn current_tool(&self) -> Option<(&str, &str)> {
        self.current
            .map(|i| (self.tools[i].id.as_str(), self.tools[i].name.as_str()))
    }

    pub fn any_started(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn tools(&self) -> &[ToolState] {
        &self.tools
    }

    /// Concatenated raw inputs across all tools (fallback token counting).
    pub fn all_inputs_text(&self) -> String {
        self.tools.iter().map(|t| t.input_text()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_object_in_one_fragment() {
        let mut agg = ToolJsonAggregator::new();
        assert!(agg.start("t1", "read_file"));
        let delta = agg.push_fragment(Some("t1"), br#"{"path":"/tmp/a"}"#);
        assert_eq!(delta.as_deref(), Some(r#"{"path":"/tmp/a"}"#));
        let (id, value) = agg.stop(Some("t1")).unwrap();
        assert_eq!(id, "t1");
        assert_eq!(value, json!({"path": "/tmp/a"}));
    }

    #[test]
    fn fragments_concatenate() {
        let mut agg = ToolJsonAggregator::new();
        agg.start("t1", "read_file");
        let mut emitted = String::new();
        for frag in [r#"{"path":""#, "/tmp/a", r#""}"#] {
            if let Some(d) = agg.push_fragment(Some("t1"), frag.as_bytes()) {
                emitted.push_str(&d);
            }
        }
        assert_eq!(emitted, r#"{"path":"/tmp/a"}"#);
        let (_, value) = agg.stop(Some("t1")).unwrap();
        assert_eq!(value, json!({"path": "/tmp/a"}));
    }

    #[test]
    fn split_mid_codepoint_reassembles_exactly() {
        let payload = json!({"note": "héllo wörld ✓"});
        let bytes = serde_json::to_vec(&payload).unwrap();

        // every possible split point, including mid-codepoint ones
        for split in 1..bytes.len() {
            let mut agg = ToolJsonAggregator::new();
            agg.start("t1", "annotate");
            let mut emitted = String::new();
            for frag in [&bytes[..split], &bytes[split..]] {
                if let Some(d) = agg.push_fragment(Some("t1"), frag) {
                    emitted.push_str(&d);
                }
            }
            let (_, value) = agg.stop(Some("t1")).unwrap();
            assert_eq!(value, payload, "split at byte {}", split);
            assert_eq!(emitted, serde_json::to_string(&payload).unwrap());
        }
    }

    #[test]
    fn one_byte_fragments_reassemble() {
        let payload = json!({"emoji": "🎉🎊", "n": 3});
        let bytes = serde_json::to_vec(&payload).unwrap();
        let mut agg = ToolJsonAggregator::new();
        agg.start("t1", "party");
        let mut emitted = String::new();
        for b in &bytes {
            if let Some(d) = agg.push_fragment(Some("t1"), std::slice::from_ref(b)) {
                emitted.push_str(&d);
            }
        }
        let (_, value) = agg.stop(Some("t1")).unwrap();
        assert_eq!(value, payload);
        assert_eq!(emitted, serde_json::to_string(&payload).unwrap());
    }

    #[test]
    fn orphan_fragments_inherit_current_tool() {
        let mut agg = ToolJsonAggregator::new();
        agg.start("t1", "read_file");
        agg.push_fragment(None, br#"{"a":1}"#);
        let (_, value) = agg.stop(None).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let mut agg = ToolJsonAggregator::new();
        assert!(agg.start("t1", "read_file"));
        assert!(!agg.start("t1", "read_file"));
        assert_eq!(agg.tools().len(), 1);
    }

    #[test]
    fn empty_buffer_is_zero_arg_call() {
        let mut agg = ToolJsonAggregator::new();
        agg.start("t1", "list");
        let (_, value) = agg.stop(Some("t1")).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn malformed_json_degrades_to_empty_object() {
        let mut agg = ToolJsonAggregator::new();
        agg.start("t1", "broken");
        agg.push_fragment(Some("t1"), br#"{"unclosed"#);
        let (_, value) = agg.stop(Some("t1")).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn fragment_without_any_tool_is_dropped() {
        let mut agg = ToolJsonAggregator::new();
        assert!(agg.push_fragment(None, b"{}").is_none());
        assert!(agg.stop(None).is_none());
    }

    #[test]
    fn two_tools_keep_separate_buffers() {
        let mut agg = ToolJsonAggregator::new();
        agg.start("t1", "first");
        agg.push_fragment(Some("t1"), br#"{"a":1}"#);
        agg.start("t2", "second");
        agg.push_fragment(None, br#"{"b":2}"#); // inherits t2
        let (_, v2) = agg.stop(Some("t2")).unwrap();
        let (_, v1) = agg.stop(Some("t1")).unwrap();
        assert_eq!(v1, json!({"a": 1}));
        assert_eq!(v2, json!({"b": 2}));
    }

    #[test]
    fn incomplete_tail_detection() {
        assert_eq!(incomplete_tail_len(b"abc"), 0);
        assert_eq!(incomplete_tail_len("é".as_bytes()), 0);
        // first byte of a 2-byte sequence
        assert_eq!(incomplete_tail_len(&[b'a', 0xC3]), 1);
        // first two bytes of a 4-byte sequence
        assert_eq!(incomplete_tail_len(&[0xF0, 0x9F]), 2);
        // complete 4-byte emoji
        assert_eq!(incomplete_tail_len("🎉".as_bytes()), 0);
    }
}
