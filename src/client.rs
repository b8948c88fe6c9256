//! Completion streaming client.
//!
//! Sends an OpenAI-compatible `POST /v1/chat/completions` with
//! `stream: true` and decodes the server-sent-event response. Fragments
//! are handed to the caller in server order as they arrive; the final
//! [`CompleteResponse`] carries the cleaned text, token usage, any tool
//! calls, and the timing needed for tokens/sec.
//!
//! Terminal conditions: a `finish_reason`, a `[DONE]` event, or the
//! connection closing end the stream normally. A transport error is a
//! [`InferenceError::Network`]; a cancelled token is
//! [`InferenceError::Cancelled`]; no content, tool-call, usage or finish
//! data for the idle timeout is a timeout-flavored [`InferenceError::Model`].
//! Keep-alive comments and empty deltas do not count as activity.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::InferenceError;
use crate::models::{ChatRequest, MessageMetrics, ToolCall, Usage};

/// The reassembled result of one streamed completion.
#[derive(Debug, Clone, Default)]
pub struct CompleteResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    pub time_to_first_token: Option<Duration>,
    pub total_time: Duration,
}

impl CompleteResponse {
    /// `completion_tokens / (total_time - time_to_first_token)`.
    pub fn tokens_per_second(&self) -> Option<f64> {
        let tokens = self.usage.as_ref()?.completion_tokens;
        let ttft = self.time_to_first_token.unwrap_or_default();
        let generating = self.total_time.checked_sub(ttft)?.as_secs_f64();
        if tokens == 0 || generating <= 0.0 {
            return None;
        }
        Some(tokens as f64 / generating)
    }

    pub fn metrics(&self) -> MessageMetrics {
        MessageMetrics {
            tokens_per_second: self.tokens_per_second(),
            response_start_ms: self.time_to_first_token.map(|d| d.as_millis() as u64),
            completion_tokens: self.usage.as_ref().map(|u| u.completion_tokens),
        }
    }
}

pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    idle_timeout: Duration,
}

impl CompletionClient {
    /// `connect_timeout` bounds connection setup; `idle_timeout` bounds the
    /// gap between chunks that carry data.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            idle_timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Stream one completion, calling `on_fragment` for every text delta.
    pub async fn chat(
        &self,
        request: &ChatRequest,
        on_fragment: &mut (dyn FnMut(&str) + Send),
        cancel: &CancellationToken,
    ) -> Result<CompleteResponse, InferenceError> {
        let started = Instant::now();
        let url = format!("{}/v1/chat/completions", self.base_url);
        tracing::debug!(%url, messages = request.messages.len(), "sending completion request");

        let send = self.http.post(&url).json(request).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            r = send => r.map_err(|e| self.transport_error(e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status.as_u16(), &body));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut acc = StreamAccumulator::new(started);

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("completion cancelled");
                    return Err(InferenceError::Cancelled);
                }
                _ = &mut idle => None,
                r = stream.next() => Some(r),
            };

            let bytes = match next {
                // Some servers keep the connection open after the final
                // chunk; once a finish_reason arrived silence is a clean end.
                None if acc.finish_reason.is_some() => break,
                None => {
                    return Err(InferenceError::model(
                        &self.model,
                        format!(
                            "timed out: no response from the model server for {}s",
                            self.idle_timeout.as_secs()
                        ),
                    ))
                }
                Some(None) => break,
                Some(Some(Err(e))) => return Err(InferenceError::Network(e.to_string())),
                Some(Some(Ok(bytes))) => bytes,
            };

            let seen = acc.activity();
            for event in decoder.push(&bytes) {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(data) => acc.apply(&data, on_fragment)?,
                }
            }
            if acc.activity() != seen {
                idle.as_mut().reset(tokio::time::Instant::now() + self.idle_timeout);
            }
            if acc.is_complete() {
                break;
            }
        }

        for event in decoder.finish() {
            if let SseEvent::Data(data) = event {
                acc.apply(&data, on_fragment)?;
            }
        }

        let response = acc.into_response(started.elapsed());
        tracing::debug!(
            finish_reason = ?response.finish_reason,
            tool_calls = response.tool_calls.len(),
            tokens_per_second = ?response.tokens_per_second(),
            "completion finished"
        );
        Ok(response)
    }

    fn transport_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_connect() || e.is_timeout() {
            InferenceError::model(&self.model, format!("model server unreachable: {}", e))
        } else {
            InferenceError::Network(e.to_string())
        }
    }

    fn status_error(&self, status: u16, body: &str) -> InferenceError {
        let message = error_message(body).unwrap_or_else(|| format!("HTTP {}", status));
        let lower = message.to_lowercase();
        if status == 404 || status == 503 || (lower.contains("model") && lower.contains("not found")) {
            InferenceError::model(&self.model, message)
        } else {
            InferenceError::ErrorResponse(message)
        }
    }
}

/// Pull a human-readable message out of an OpenAI/llama.cpp error body.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    match error {
        serde_json::Value::String(s) => Some(s.clone()),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
    }
}

/// Normalize a finished answer: trim trailing whitespace and drop a stray
/// trailing `"`. A trailing quote is kept when the nearest quote before it
/// opens a quotation (it starts the text or follows whitespace or a
/// bracket). Applying it twice is the same as applying it once.
pub fn clean_response_text(text: &str) -> String {
    let mut cleaned = text.trim_end();
    while let Some(body) = cleaned.strip_suffix('"') {
        if closes_open_quote(body) {
            break;
        }
        cleaned = body.trim_end();
    }
    cleaned.to_string()
}

fn closes_open_quote(body: &str) -> bool {
    let Some(at) = body.rfind('"') else {
        return false;
    };
    body[..at]
        .chars()
        .next_back()
        .map_or(true, |c| c.is_whitespace() || matches!(c, '(' | '['))
}

// ============ SSE decoding ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental SSE decoder. Bytes may be split anywhere, including inside
/// a UTF-8 sequence; events are only emitted once their blank-line
/// terminator has arrived.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Flush a trailing event that was never terminated.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest).into_owned();
            self.line(rest.trim_end_matches('\r'), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // `event:`, `id:`, `retry:` and `:` comments carry nothing we use.
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        if self.data.is_empty() {
            return;
        }
        let data = self.data.join("\n");
        self.data.clear();
        if data.trim() == "[DONE]" {
            events.push(SseEvent::Done);
        } else {
            events.push(SseEvent::Data(data));
        }
    }
}

// ============ Chunk accumulation ============

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds decoded chunks into a response.
pub struct StreamAccumulator {
    started: Instant,
    text: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    calls: BTreeMap<usize, PartialCall>,
    first_token: Option<Duration>,
    activity: u64,
}

impl StreamAccumulator {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            text: String::new(),
            finish_reason: None,
            usage: None,
            calls: BTreeMap::new(),
            first_token: None,
            activity: 0,
        }
    }

    /// Count of applied chunks that carried content, tool calls, usage or
    /// a finish reason.
    pub fn activity(&self) -> u64 {
        self.activity
    }

    /// Apply one `data:` payload. Unparseable payloads are skipped.
    pub fn apply(
        &mut self,
        data: &str,
        on_fragment: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), InferenceError> {
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream chunk");
                return Ok(());
            }
        };

        if let Some(error) = chunk.error {
            let message = match &error {
                serde_json::Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            return Err(InferenceError::ErrorResponse(message));
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
            self.activity += 1;
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.activity += 1;
                self.mark_first_token();
                self.text.push_str(&content);
                on_fragment(&content);
            }
            for delta in choice.delta.tool_calls {
                self.activity += 1;
                self.mark_first_token();
                let call = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = Some(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
                self.activity += 1;
            }
        }
        Ok(())
    }

    fn mark_first_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(self.started.elapsed());
        }
    }

    /// Finished and, when the server reports usage, usage has arrived.
    fn is_complete(&self) -> bool {
        self.finish_reason.is_some() && self.usage.is_some()
    }

    pub fn into_response(self, total_time: Duration) -> CompleteResponse {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name: call.name,
                arguments: call.arguments,
            })
            .collect();

        CompleteResponse {
            text: clean_response_text(&self.text),
            finish_reason: self.finish_reason,
            usage: self.usage,
            tool_calls,
            time_to_first_token: self.first_token,
            total_time,
        }
    }
}
