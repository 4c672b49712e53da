//! The LLM provider layer: one streaming contract over three wire protocols.
//!
//! The agent speaks only the vocabulary defined here — `Message`, `ToolCall`,
//! `StreamEvent`, `Usage` — and never sees a provider SDK type. Each adapter
//! translates the conversation into its protocol's message shape, parses the
//! streamed response, and emits events in issuance order: any number of
//! `Text` deltas and complete `ToolCall`s, then exactly one `Done`.

pub mod anthropic;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

// ── Conversation vocabulary ───────────────────────────────────────────────────

/// One message in the conversation. The system prompt is not a message — it
/// is held separately by the agent and stays byte-identical across handovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User { content: String },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult { tool_call_id: String, content: String },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant { content: content.into(), tool_calls }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

/// A structured request by the model to invoke a named tool. `arguments` is
/// the raw JSON text as emitted; parsing is deferred to dispatch so a broken
/// payload can be surfaced without losing the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A tool definition in the unified shape; each adapter renders it into its
/// provider's schema dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Events produced by a streaming completion, in issuance order. `Text`
/// deltas are concatenable; `ToolCall` is emitted only once name and argument
/// JSON are complete; `Done` arrives exactly once, last.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    ToolCall(ToolCall),
    Done(Usage),
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl ClientError {
    /// Classify a non-success HTTP status the way every adapter needs to.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ClientError::Auth(body),
            _ => ClientError::Api { status, message: body },
        }
    }
}

pub type EventRx = mpsc::Receiver<Result<StreamEvent, ClientError>>;

// ── Cancellation ──────────────────────────────────────────────────────────────

/// One cancel pair is issued per agent run. Tripping the handle is idempotent;
/// tokens are checked at step boundaries and raced against stream reads, so a
/// cancel closes the provider connection without being treated as an error.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the handle fires. Never resolves if the handle is dropped
    /// without firing — callers always race this against real work.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ── The streaming contract ────────────────────────────────────────────────────

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// The model identifier requests are issued against.
    fn model(&self) -> &str;

    /// Open a streaming completion for the conversation. The returned channel
    /// yields events in issuance order and closes after `Done` — or earlier,
    /// silently, when `cancel` fires.
    async fn stream(
        &self,
        system_prompt: &str,
        conversation: &[Message],
        tools: &[ToolSpec],
        cancel: CancelToken,
    ) -> Result<EventRx, ClientError>;
}

// ── Shared wire-parsing helpers ───────────────────────────────────────────────

/// Reassembles complete lines from a byte stream. HTTP chunk boundaries fall
/// anywhere, so both SSE and NDJSON adapters carry partial lines here between
/// reads.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line = self.pending[..pos].trim_end_matches('\r').to_string();
            self.pending.drain(..=pos);
            lines.push(line);
        }
        lines
    }
}

/// Give synthetic `call_N` ids to tool calls from providers that don't issue
/// them, numbering within the current response.
pub(crate) fn synthesize_ids(calls: &mut [ToolCall]) {
    for (i, call) in calls.iter_mut().enumerate() {
        if call.id.is_empty() {
            call.id = format!("call_{i}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_reassembles_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"par").is_empty());
        let lines = buf.push(b"tial\": 1}\r\ndata: done\n");
        assert_eq!(lines, vec!["data: {\"partial\": 1}", "data: done"]);
    }

    #[test]
    fn synthetic_ids_fill_only_gaps() {
        let mut calls = vec![
            ToolCall { id: String::new(), name: "read".into(), arguments: "{}".into() },
            ToolCall { id: "call_abc".into(), name: "shell".into(), arguments: "{}".into() },
            ToolCall { id: String::new(), name: "write".into(), arguments: "{}".into() },
        ];
        synthesize_ids(&mut calls);
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].id, "call_abc");
        assert_eq!(calls[2].id, "call_2");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_observable() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // resolves immediately
    }

    #[test]
    fn message_serialization_carries_role_tags() {
        let msg = Message::assistant(
            "on it",
            vec![ToolCall { id: "call_0".into(), name: "read".into(), arguments: "{}".into() }],
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
        assert!(json.contains("\"tool_calls\""));

        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Assistant { content, tool_calls } => {
                assert_eq!(content, "on it");
                assert_eq!(tool_calls.len(), 1);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
