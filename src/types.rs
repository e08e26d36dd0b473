//! Normalized request, response, and stream types
//!
//! Everything that crosses the adapter boundary is expressed in the types
//! here. Provider wire shapes are private to each adapter module and never
//! leak through the interface.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{RouterError, RouterResult};

/// Message roles in a chat sequence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    Function,
}

/// A single part of multi-part message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// Message content: plain text or a sequence of parts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text; image parts contribute nothing
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Parts(p) => p.is_empty(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// Chat message structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            name: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            name: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            name: None,
            tool_calls: None,
        }
    }
}

/// Tool definition offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool selection directive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
    Named { name: String },
}

/// A tool invocation produced by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the provider
    pub arguments: String,
}

/// Incremental tool-call fragment carried in stream chunks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Requested output shape
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Per-request generation options
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RequestOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub response_format: Option<ResponseFormat>,
    pub stream: bool,
    pub seed: Option<u64>,
    pub tools: Option<Vec<ToolSchema>>,
    pub tool_choice: Option<ToolChoice>,
    /// Per-request deadline in milliseconds; defaults applied by the pipeline
    pub timeout_ms: Option<u64>,
    /// Buffer a streamed response for cache insertion once it completes
    pub cache_streamed: bool,
}

/// Model capabilities a request may require
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Chat,
    Embedding,
    Vision,
    ToolUse,
    FunctionCalling,
    JsonMode,
    Streaming,
    Rerank,
    ImageGen,
    VideoGen,
    Speech,
}

/// Soft constraints used when no explicit model is requested
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Requirements {
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
    pub max_cost: Option<f64>,
    pub min_context: Option<u32>,
    #[serde(default)]
    pub speed_priority: bool,
    #[serde(default)]
    pub quality_priority: bool,
}

/// API-key tier classes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Pro,
    Enterprise,
    Admin,
}

/// Authenticated caller identity attached by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthContext {
    pub key_id: String,
    pub tier: Tier,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
}

/// Normalized inference request, the pipeline's input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub prompt: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
    pub model_hint: Option<String>,
    pub requirements: Option<Requirements>,
    #[serde(default)]
    pub options: RequestOptions,
    pub session_id: Option<String>,
    /// Raw credential as presented to the host server
    pub api_key: Option<String>,
    /// Populated by the pipeline after authentication
    pub auth: Option<AuthContext>,
}

impl Request {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: Some(prompt.into()),
            messages: None,
            model_hint: None,
            requirements: None,
            options: RequestOptions::default(),
            session_id: None,
            api_key: None,
            auth: None,
        }
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: None,
            messages: Some(messages),
            model_hint: None,
            requirements: None,
            options: RequestOptions::default(),
            session_id: None,
            api_key: None,
            auth: None,
        }
    }

    /// Enforce structural invariants: exactly one of prompt/messages set,
    /// sampling parameters in range.
    pub fn validate(&self) -> RouterResult<()> {
        match (&self.prompt, &self.messages) {
            (Some(_), Some(_)) => {
                return Err(RouterError::Validation(
                    "exactly one of prompt or messages must be set, got both".into(),
                ))
            }
            (None, None) => {
                return Err(RouterError::Validation(
                    "exactly one of prompt or messages must be set, got neither".into(),
                ))
            }
            (None, Some(msgs)) if msgs.is_empty() => {
                return Err(RouterError::Validation("messages must not be empty".into()))
            }
            _ => {}
        }
        if let Some(t) = self.options.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RouterError::Validation(format!(
                    "temperature {} outside [0, 2]",
                    t
                )));
            }
        }
        if let Some(p) = self.options.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(RouterError::Validation(format!(
                    "top_p {} outside [0, 1]",
                    p
                )));
            }
        }
        Ok(())
    }

    /// Canonical message sequence: a bare prompt becomes a single user turn
    pub fn canonical_messages(&self) -> Vec<ChatMessage> {
        if let Some(messages) = &self.messages {
            messages.clone()
        } else if let Some(prompt) = &self.prompt {
            vec![ChatMessage::user(prompt.as_str())]
        } else {
            Vec::new()
        }
    }

    /// Flattened prompt text, used for token estimation and cache embedding
    pub fn prompt_text(&self) -> String {
        self.canonical_messages()
            .iter()
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Capabilities the request needs from a model
    pub fn required_capabilities(&self) -> HashSet<Capability> {
        let mut caps: HashSet<Capability> = self
            .requirements
            .as_ref()
            .map(|r| r.capabilities.clone())
            .unwrap_or_default();
        caps.insert(Capability::Chat);
        if self.options.tools.is_some() {
            caps.insert(Capability::ToolUse);
        }
        if self.options.response_format == Some(ResponseFormat::Json) {
            caps.insert(Capability::JsonMode);
        }
        if self.options.stream {
            caps.insert(Capability::Streaming);
        }
        caps
    }
}

/// Token usage totals
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Terminal condition of a completion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    Safety,
    Error,
}

/// Unified response shape returned by every adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub latency_ms: u64,
    pub model: String,
    pub provider: String,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One element of a streamed token sequence. The final chunk carries
/// `done = true` and usage totals when the provider supplies them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_delta: Option<ToolCallDelta>,
    pub index: u32,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>, index: u32) -> Self {
        Self {
            delta: Some(text.into()),
            index,
            ..Default::default()
        }
    }

    pub fn done(usage: Option<TokenUsage>, finish_reason: Option<FinishReason>) -> Self {
        Self {
            done: true,
            usage,
            finish_reason,
            ..Default::default()
        }
    }
}

/// Conservative token estimate used for admission accounting and
/// context-window pre-checks: one token per four characters, minimum one.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() + 3) / 4).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_input_invariant() {
        let mut req = Request::from_prompt("hello");
        assert!(req.validate().is_ok());

        req.messages = Some(vec![ChatMessage::user("also")]);
        assert!(matches!(req.validate(), Err(RouterError::Validation(_))));

        req.prompt = None;
        assert!(req.validate().is_ok());

        req.messages = None;
        assert!(matches!(req.validate(), Err(RouterError::Validation(_))));
    }

    #[test]
    fn test_temperature_range() {
        let mut req = Request::from_prompt("hi");
        req.options.temperature = Some(2.5);
        assert!(req.validate().is_err());
        req.options.temperature = Some(2.0);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_prompt_canonicalization() {
        let req = Request::from_prompt("explain monads");
        let msgs = req.canonical_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, MessageRole::User);
        assert_eq!(msgs[0].content.as_text(), "explain monads");
    }

    #[test]
    fn test_required_capabilities_from_options() {
        let mut req = Request::from_prompt("hi");
        req.options.tools = Some(vec![ToolSchema {
            name: "lookup".into(),
            description: "lookup a fact".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);
        req.options.response_format = Some(ResponseFormat::Json);
        let caps = req.required_capabilities();
        assert!(caps.contains(&Capability::ToolUse));
        assert!(caps.contains(&Capability::JsonMode));
        assert!(caps.contains(&Capability::Chat));
    }

    #[test]
    fn test_multipart_content_flattening() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is in ".into(),
            },
            ContentPart::ImageUrl {
                url: "https://example.com/cat.png".into(),
            },
            ContentPart::Text {
                text: "this image?".into(),
            },
        ]);
        assert_eq!(content.as_text(), "what is in this image?");
    }

    #[test]
    fn test_usage_totals() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
