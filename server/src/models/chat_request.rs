//! Client-protocol request types for the two downstream surfaces.
//!
//! Both the Anthropic `/v1/messages` body and the OpenAI
//! `/v1/chat/completions` body normalize into [`NormalizedRequest`], which is
//! what the coordinator, tokenizer, and upstream payload builder consume.

use serde::Deserialize;
use serde_json::Value;

/// Message role after normalization. System prompts are threaded
/// separately, so only two roles survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A tool definition in provider-neutral form.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The result of a prior tool invocation, echoed back by the client.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: Role,
    pub content: String,
    /// Tool results attached to a user turn.
    pub tool_results: Vec<ToolResult>,
}

/// Provider-neutral request consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub model: String,
    /// Set when a model alias map rewrote the requested model.
    pub original_model: Option<String>,
    pub stream: bool,
    pub system: Option<String>,
    pub messages: Vec<NormalizedMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
}

// =============================================================================
// Anthropic /v1/messages
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Anthropic allows the system prompt as a bare string or a block list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

impl SystemPrompt {
    fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

/// A single inbound content block. Unknown block types deserialize (the
/// fields are all optional) and flatten to nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub content: Option<Box<AnthropicContent>>,
}

impl AnthropicContent {
    fn flatten_text(&self) -> String {
        match self {
            AnthropicContent::Text(s) => s.clone(),
            AnthropicContent::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    match block.kind.as_str() {
                        "text" => {
                            if let Some(text) = &block.text {
                                if !out.is_empty() {
                                    out.push('\n');
                                }
                                out.push_str(text);
                            }
                        }
                        // Assistant tool_use turns are echoed into history as
                        // a compact textual marker; the upstream does not
                        // accept structured tool calls in history.
                        "tool_use" => {
                            if !out.is_empty() {
                                out.push('\n');
                            }
                            out.push_str(&format!(
                                "[tool call: {}]",
                                block.name.as_deref().unwrap_or("unknown")
                            ));
                        }
                        _ => {}
                    }
                }
                out
            }
        }
    }

    fn tool_results(&self) -> Vec<ToolResult> {
        let AnthropicContent::Blocks(blocks) = self else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|b| b.kind == "tool_result")
            .map(|b| ToolResult {
                tool_use_id: b.tool_use_id.clone().unwrap_or_default(),
                content: b
                    .content
                    .as_ref()
                    .map(|c| c.flatten_text())
                    .or_else(|| b.text.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl AnthropicRequest {
    pub fn normalize(self) -> NormalizedRequest {
        let system = self.system.as_ref().map(|s| s.flatten()).filter(|s| !s.is_empty());
        let messages = self
            .messages
            .into_iter()
            .map(|m| {
                let role = if m.role == "assistant" {
                    Role::Assistant
                } else {
                    Role::User
                };
                NormalizedMessage {
                    role,
                    content: m.content.flatten_text(),
                    tool_results: if role == Role::User {
                        m.content.tool_results()
                    } else {
                        Vec::new()
                    },
                }
            })
            .collect();
        let tools = self
            .tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            })
            .collect();
        NormalizedRequest {
            model: self.model,
            original_model: None,
            stream: self.stream,
            system,
            messages,
            tools,
            max_tokens: self.max_tokens,
        }
    }
}

// =============================================================================
// OpenAI /v1/chat/completions
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub tools: Vec<OpenAiTool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAiContent>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl OpenAiContent {
    fn flatten_text(&self) -> String {
        match self {
            OpenAiContent::Text(s) => s.clone(),
            OpenAiContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: OpenAiFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

impl ChatCompletionsRequest {
    pub fn normalize(self) -> NormalizedRequest {
        let mut system_parts = Vec::new();
        let mut messages: Vec<NormalizedMessage> = Vec::new();

        for m in self.messages {
            match m.role.as_str() {
                "system" | "developer" => {
                    if let Some(content) = &m.content {
                        system_parts.push(content.flatten_text());
                    }
                }
                "assistant" => {
                    let mut content = m
                        .content
                        .as_ref()
                        .map(|c| c.flatten_text())
                        .unwrap_or_default();
                    for call in &m.tool_calls {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(&format!("[tool call: {}]", call.function.name));
                    }
                    messages.push(NormalizedMessage {
                        role: Role::Assistant,
                        content,
                        tool_results: Vec::new(),
                    });
                }
                // OpenAI tool-result turns fold into the preceding user turn
                // the way Anthropic tool_result blocks do.
                "tool" => {
                    let result = ToolResult {
                        tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                        content: m
                            .content
                            .as_ref()
                            .map(|c| c.flatten_text())
                            .unwrap_or_default(),
                    };
                    match messages.last_mut() {
                        Some(last) if last.role == Role::User => {
                            last.tool_results.push(result)
                        }
                        _ => messages.push(NormalizedMessage {
                            role: Role::User,
                            content: String::new(),
                            tool_results: vec![result],
                        }),
                    }
                }
                _ => {
                    messages.push(NormalizedMessage {
                        role: Role::User,
                        content: m
                            .content
                            .as_ref()
                            .map(|c| c.flatten_text())
                            .unwrap_or_default(),
                        tool_results: Vec::new(),
                    });
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        };

        let tools = self
            .tools
            .into_iter()
            .filter(|t| t.kind == "function")
            .map(|t| ToolSpec {
                name: t.function.name,
                description: t.function.description.unwrap_or_default(),
                input_schema: t.function.parameters,
            })
            .collect();

        NormalizedRequest {
            model: self.model,
            original_model: None,
            stream: self.stream,
            system,
            messages,
            tools,
            max_tokens: self.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anthropic_string_content_normalizes() {
        let req: AnthropicRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .unwrap();
        let norm = req.normalize();
        assert!(!norm.stream);
        assert_eq!(norm.messages.len(), 1);
        assert_eq!(norm.messages[0].role, Role::User);
        assert_eq!(norm.messages[0].content, "Hello");
    }

    #[test]
    fn anthropic_block_content_and_tool_results() {
        let req: AnthropicRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "system": [{"type": "text", "text": "be terse"}],
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "t1", "name": "read_file", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "file contents"}
                ]}
            ]
        }))
        .unwrap();
        let norm = req.normalize();
        assert_eq!(norm.system.as_deref(), Some("be terse"));
        assert_eq!(norm.messages[0].role, Role::Assistant);
        assert!(norm.messages[0].content.contains("read_file"));
        assert_eq!(norm.messages[1].tool_results.len(), 1);
        assert_eq!(norm.messages[1].tool_results[0].content, "file contents");
    }

    #[test]
    fn openai_system_messages_thread_into_system_prompt() {
        let req: ChatCompletionsRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "hi"},
                {"role": "tool", "tool_call_id": "c1", "content": "42"}
            ],
            "tools": [
                {"type": "function", "function": {"name": "calc", "parameters": {"type": "object"}}}
            ]
        }))
        .unwrap();
        let norm = req.normalize();
        assert!(norm.stream);
        assert_eq!(norm.system.as_deref(), Some("be helpful"));
        assert_eq!(norm.tools.len(), 1);
        assert_eq!(norm.tools[0].name, "calc");
        // tool turn folded into the trailing user message
        assert_eq!(norm.messages.len(), 2);
        assert_eq!(norm.messages[1].tool_results.len(), 1);
    }
}
