//! Core data models shared by the indexer, assembler, client and session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::prompt::strip_sources;

/// One embedded chunk. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexItem {
    pub id: String,
    pub text: String,
    /// Source URL or path the chunk came from.
    pub source: String,
    pub vector: Vec<f32>,
    /// Zero-based position of the chunk within its source.
    pub sequence: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A chunk produced by the chunker, before embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub source: String,
    pub sequence: usize,
    pub text: String,
    /// SHA-256 of `text`, used to reuse cached vectors.
    pub hash: String,
}

/// A retrieved or attached source offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub text: String,
    pub url: String,
}

impl Source {
    pub fn new(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: url.into(),
        }
    }

    pub fn is_web(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

// ============ Conversation ============

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Per-turn generation metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetrics {
    pub tokens_per_second: Option<f64>,
    /// Milliseconds from request start to the first streamed token.
    pub response_start_ms: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// One turn in a conversation.
///
/// `text` holds the submitted form. For user turns that may include the
/// appended sources block; [`displayed_text`](Message::displayed_text)
/// strips it for rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metrics: MessageMetrics,
    #[serde(default)]
    pub ended: bool,
    /// Tool calls requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool turns, the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            created_at: now,
            updated_at: now,
            metrics: MessageMetrics::default(),
            ended: false,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A finished turn.
    pub fn ended(role: Role, text: impl Into<String>) -> Self {
        let mut msg = Self::new(role, text);
        msg.ended = true;
        msg
    }

    pub fn displayed_text(&self) -> &str {
        strip_sources(&self.text)
    }

    /// Freezes the message.
    pub fn end(&mut self) {
        self.ended = true;
        self.updated_at = Utc::now();
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.text.clone(),
            tool_calls: if self.tool_calls.is_empty() {
                None
            } else {
                Some(self.tool_calls.iter().map(WireToolCall::from).collect())
            },
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

// ============ Wire types ============

/// Role + content pair sent to `/v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Request payload. Rebuilt for every call, never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub stream: bool,
    pub stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

/// A structured tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the arguments, exactly as the model produced it.
    pub arguments: String,
}

/// OpenAI wire shape of a tool call inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFunction {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: "function".to_string(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// Token accounting reported by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}
