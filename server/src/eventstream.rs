//! Incremental parser for the AWS EventStream binary framing.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32
//! ```
//!
//! A header is `name_len:u8 | name | type:u8 | value`. The parser buffers
//! partial input and only ever yields complete frames; CRC fields are
//! carried in the framing but not verified (the upstream is trusted).

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

/// Prelude (12 bytes) plus trailing message CRC (4 bytes).
const FRAME_OVERHEAD: usize = 16;
/// Upper bound on a single frame; anything larger is a corrupt length.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("frame length {0} out of range")]
    BadFrameLength(usize),

    #[error("header block overruns frame")]
    HeaderOverrun,

    #[error("unknown header value type {0}")]
    UnknownHeaderType(u8),

    #[error("header name is not UTF-8")]
    BadHeaderName,

    #[error("string header is not UTF-8")]
    BadHeaderString,

    #[error("malformed {0} payload: {1}")]
    BadPayload(&'static str, #[source] serde_json::Error),
}

/// A typed header value. Wire type codes 0-9.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    BoolTrue,
    BoolFalse,
    Byte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    ByteArray(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

/// One complete EventStream frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(n, v)| {
            if n == name {
                match v {
                    HeaderValue::String(s) => Some(s.as_str()),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    pub fn message_type(&self) -> &str {
        self.header_str(":message-type").unwrap_or("event")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(":exception-type")
    }
}

/// Stateful byte-accumulating frame parser. `feed` never yields a partial
/// frame; the unconsumed tail stays buffered for the next call.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buf: BytesMut,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, EventStreamError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let total = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if total < FRAME_OVERHEAD || total > MAX_FRAME_LEN {
                return Err(EventStreamError::BadFrameLength(total));
            }
            if self.buf.len() < total {
                break;
            }
            let raw = self.buf.split_to(total).freeze();
            frames.push(parse_frame(&raw)?);
        }
        Ok(frames)
    }

    /// Bytes still buffered (a partial frame, or zero at a clean boundary).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn parse_frame(raw: &Bytes) -> Result<Frame, EventStreamError> {
    let total = raw.len();
    let headers_len =
        u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    // bytes 8..12 are the prelude CRC, unverified
    if FRAME_OVERHEAD + headers_len > total {
        return Err(EventStreamError::HeaderOverrun);
    }
    let headers = parse_headers(&raw[12..12 + headers_len])?;
    let payload = raw.slice(12 + headers_len..total - 4);
    Ok(Frame { headers, payload })
}

fn parse_headers(mut b: &[u8]) -> Result<Vec<(String, HeaderValue)>, EventStreamError> {
    let mut headers = Vec::new();
    while !b.is_empty() {
        let name_len = b[0] as usize;
        b = &b[1..];
        if b.len() < name_len + 1 {
            return Err(EventStreamError::HeaderOverrun);
        }
        let name = std::str::from_utf8(&b[..name_len])
            .map_err(|_| EventStreamError::BadHeaderName)?
            .to_string();
        let value_type = b[name_len];
        b = &b[name_len + 1..];

        let value = match value_type {
            0 => HeaderValue::BoolTrue,
            1 => HeaderValue::BoolFalse,
            2 => {
                let v = take(&mut b, 1)?;
                HeaderValue::Byte(v[0] as i8)
            }
            3 => {
                let v = take(&mut b, 2)?;
                HeaderValue::Int16(i16::from_be_bytes([v[0], v[1]]))
            }
            4 => {
                let v = take(&mut b, 4)?;
                HeaderValue::Int32(i32::from_be_bytes([v[0], v[1], v[2], v[3]]))
            }
            5 => {
                let v = take(&mut b, 8)?;
                HeaderValue::Int64(i64::from_be_bytes(v.try_into().unwrap()))
            }
            6 => {
                let len = take(&mut b, 2)?;
                let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                HeaderValue::ByteArray(take(&mut b, len)?.to_vec())
            }
            7 => {
                let len = take(&mut b, 2)?;
                let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                let s = std::str::from_utf8(take(&mut b, len)?)
                    .map_err(|_| EventStreamError::BadHeaderString)?;
                HeaderValue::String(s.to_string())
            }
            8 => {
                let v = take(&mut b, 8)?;
                HeaderValue::Timestamp(i64::from_be_bytes(v.try_into().unwrap()))
            }
            9 => {
                let v = take(&mut b, 16)?;
                HeaderValue::Uuid(v.try_into().unwrap())
            }
            other => return Err(EventStreamError::UnknownHeaderType(other)),
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn take<'a>(b: &mut &'a [u8], n: usize) -> Result<&'a [u8], EventStreamError> {
    if b.len() < n {
        return Err(EventStreamError::HeaderOverrun);
    }
    let (head, tail) = b.split_at(n);
    *b = tail;
    Ok(head)
}

// =============================================================================
// Typed upstream events
// =============================================================================

/// A `toolUseEvent` payload. The same event type carries three shapes:
/// a start (id + name, possibly with bundled input/stop), an input
/// fragment (input only), and a stop marker (stop only).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsePayload {
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub stop: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialResponsePayload {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponsePayload {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringPayload {
    #[serde(default, alias = "creditUsage")]
    pub usage: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsagePayload {
    #[serde(default, alias = "contextUsagePercentage")]
    pub percentage: Option<f64>,
}

/// Events the stream translators consume, one variant per upstream
/// `:event-type`, plus in-stream exceptions.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    InitialResponse(InitialResponsePayload),
    AssistantResponse(AssistantResponsePayload),
    ToolUse(ToolUsePayload),
    ResponseEnd,
    Metering(MeteringPayload),
    ContextUsage(ContextUsagePayload),
    CodeReference(serde_json::Value),
    /// An in-stream exception frame (`:message-type = exception`).
    Exception { kind: String, message: String },
}

/// Decode one frame into a typed event. Unknown event types yield `None`.
pub fn decode_event(frame: &Frame) -> Result<Option<UpstreamEvent>, EventStreamError> {
    if frame.message_type() == "exception" {
        let kind = frame.exception_type().unwrap_or("unknown").to_string();
        let message = match serde_json::from_slice::<serde_json::Value>(&frame.payload) {
            Ok(v) => v
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| v.to_string()),
            Err(_) => String::from_utf8_lossy(&frame.payload).into_owned(),
        };
        return Ok(Some(UpstreamEvent::Exception { kind, message }));
    }

    let Some(event_type) = frame.event_type() else {
        return Ok(None);
    };

    let event = match event_type {
        "initial-response" => {
            let payload: InitialResponsePayload = if frame.payload.is_empty() {
                InitialResponsePayload::default()
            } else {
                serde_json::from_slice(&frame.payload)
                    .map_err(|e| EventStreamError::BadPayload("initial-response", e))?
            };
            UpstreamEvent::InitialResponse(payload)
        }
        "assistantResponseEvent" => {
            let payload: AssistantResponsePayload = serde_json::from_slice(&frame.payload)
                .map_err(|e| EventStreamError::BadPayload("assistantResponseEvent", e))?;
            UpstreamEvent::AssistantResponse(payload)
        }
        "toolUseEvent" => {
            let payload: ToolUsePayload = serde_json::from_slice(&frame.payload)
                .map_err(|e| EventStreamError::BadPayload("toolUseEvent", e))?;
            UpstreamEvent::ToolUse(payload)
        }
        "assistantResponseEnd" => UpstreamEvent::ResponseEnd,
        "meteringEvent" => {
            let payload: MeteringPayload =
                serde_json::from_slice(&frame.payload).unwrap_or_default();
            UpstreamEvent::Metering(payload)
        }
        "contextUsageEvent" => {
            let payload: ContextUsagePayload =
                serde_json::from_slice(&frame.payload).unwrap_or_default();
            UpstreamEvent::ContextUsage(payload)
        }
        "codeReferenceEvent" => {
            let payload =
                serde_json::from_slice(&frame.payload).unwrap_or(serde_json::Value::Null);
            UpstreamEvent::CodeReference(payload)
        }
        other => {
            tracing::debug!(event_type = other, "skipping unknown upstream event type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Encode a frame for test fixtures. CRC fields are zeroed; the parser
/// does not verify them.
pub fn encode_frame(headers: &[(&str, HeaderValue)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        match value {
            HeaderValue::BoolTrue => header_bytes.push(0),
            HeaderValue::BoolFalse => header_bytes.push(1),
            HeaderValue::Byte(v) => {
                header_bytes.push(2);
                header_bytes.push(*v as u8);
            }
            HeaderValue::Int16(v) => {
                header_bytes.push(3);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int32(v) => {
                header_bytes.push(4);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int64(v) => {
                header_bytes.push(5);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::ByteArray(v) => {
                header_bytes.push(6);
                header_bytes.extend_from_slice(&(v.len() as u16).to_be_bytes());
                header_bytes.extend_from_slice(v);
            }
            HeaderValue::String(v) => {
                header_bytes.push(7);
                header_bytes.extend_from_slice(&(v.len() as u16).to_be_bytes());
                header_bytes.extend_from_slice(v.as_bytes());
            }
            HeaderValue::Timestamp(v) => {
                header_bytes.push(8);
                header_bytes.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Uuid(v) => {
                header_bytes.push(9);
                header_bytes.extend_from_slice(v);
            }
        }
    }

    let total = FRAME_OVERHEAD + header_bytes.len() + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; 4]); // prelude CRC
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0u8; 4]); // message CRC
    out
}

/// Encode a named event frame with a JSON payload, for tests.
pub fn encode_event_frame(event_type: &str, payload: &serde_json::Value) -> Vec<u8> {
    encode_frame(
        &[
            (":message-type", HeaderValue::String("event".into())),
            (":event-type", HeaderValue::String(event_type.into())),
            (":content-type", HeaderValue::String("application/json".into())),
        ],
        payload.to_string().as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_frames() -> Vec<Vec<u8>> {
        vec![
            encode_event_frame("initial-response", &json!({"conversationId": "c-1"})),
            encode_event_frame("assistantResponseEvent", &json!({"content": "Hello"})),
            encode_event_frame(
                "toolUseEvent",
                &json!({"toolUseId": "t1", "name": "read_file"}),
            ),
            encode_event_frame("assistantResponseEnd", &json!({})),
        ]
    }

    #[test]
    fn whole_stream_in_one_feed() {
        let bytes: Vec<u8> = sample_frames().concat();
        let mut parser = EventStreamParser::new();
        let frames = parser.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(parser.buffered(), 0);
        assert_eq!(frames[0].event_type(), Some("initial-response"));
        assert_eq!(frames[3].event_type(), Some("assistantResponseEnd"));
    }

    #[test]
    fn byte_at_a_time_feed_yields_same_frames() {
        let bytes: Vec<u8> = sample_frames().concat();
        let mut parser = EventStreamParser::new();
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(parser.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(frames.len(), 4);
        assert_eq!(parser.buffered(), 0);
        assert_eq!(frames[1].event_type(), Some("assistantResponseEvent"));
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let bytes = encode_event_frame("assistantResponseEvent", &json!({"content": "hi"}));
        let mut parser = EventStreamParser::new();
        let split = bytes.len() - 3;
        assert!(parser.feed(&bytes[..split]).unwrap().is_empty());
        assert!(parser.buffered() > 0);
        let frames = parser.feed(&bytes[split..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn all_header_value_types_round_trip() {
        let headers: Vec<(&str, HeaderValue)> = vec![
            ("t", HeaderValue::BoolTrue),
            ("f", HeaderValue::BoolFalse),
            ("b", HeaderValue::Byte(-3)),
            ("s16", HeaderValue::Int16(-1234)),
            ("s32", HeaderValue::Int32(70_000)),
            ("s64", HeaderValue::Int64(-9_000_000_000)),
            ("bin", HeaderValue::ByteArray(vec![1, 2, 3])),
            ("str", HeaderValue::String("hello".into())),
            ("ts", HeaderValue::Timestamp(1_700_000_000_000)),
            ("id", HeaderValue::Uuid([7u8; 16])),
        ];
        let bytes = encode_frame(&headers, b"{}");
        let mut parser = EventStreamParser::new();
        let frames = parser.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].headers.len(), headers.len());
        for ((name, value), (parsed_name, parsed_value)) in
            headers.iter().zip(frames[0].headers.iter())
        {
            assert_eq!(name, parsed_name);
            assert_eq!(value, parsed_value);
        }
    }

    #[test]
    fn unknown_header_type_fails_the_frame() {
        let mut bytes = encode_frame(&[("x", HeaderValue::BoolTrue)], b"");
        // corrupt the type byte of header "x"
        bytes[12 + 2] = 42;
        let mut parser = EventStreamParser::new();
        let err = parser.feed(&bytes).unwrap_err();
        assert!(matches!(err, EventStreamError::UnknownHeaderType(42)));
    }

    #[test]
    fn bogus_total_length_is_rejected() {
        let mut parser = EventStreamParser::new();
        let err = parser.feed(&[0, 0, 0, 2, 0, 0]).unwrap_err();
        assert!(matches!(err, EventStreamError::BadFrameLength(2)));
    }

    #[test]
    fn decode_tool_use_payload() {
        let bytes = encode_event_frame(
            "toolUseEvent",
            &json!({"toolUseId": "t1", "name": "read_file", "input": "{\"pa", "stop": false}),
        );
        let mut parser = EventStreamParser::new();
        let frames = parser.feed(&bytes).unwrap();
        let event = decode_event(&frames[0]).unwrap().unwrap();
        match event {
            UpstreamEvent::ToolUse(payload) => {
                assert_eq!(payload.tool_use_id.as_deref(), Some("t1"));
                assert_eq!(payload.name.as_deref(), Some("read_file"));
                assert_eq!(payload.input.as_deref(), Some("{\"pa"));
                assert_eq!(payload.stop, Some(false));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn decode_exception_frame() {
        let bytes = encode_frame(
            &[
                (":message-type", HeaderValue::String("exception".into())),
                (
                    ":exception-type",
                    HeaderValue::String("AccessDeniedException".into()),
                ),
            ],
            br#"{"message": "account is suspended"}"#,
        );
        let mut parser = EventStreamParser::new();
        let frames = parser.feed(&bytes).unwrap();
        let event = decode_event(&frames[0]).unwrap().unwrap();
        match event {
            UpstreamEvent::Exception { kind, message } => {
                assert_eq!(kind, "AccessDeniedException");
                assert_eq!(message, "account is suspended");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_type_is_skipped() {
        let bytes = encode_event_frame("somethingNew", &json!({}));
        let mut parser = EventStreamParser::new();
        let frames = parser.feed(&bytes).unwrap();
        assert!(decode_event(&frames[0]).unwrap().is_none());
    }
}
