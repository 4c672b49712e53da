//! OpenAI-compatible adapter (`/v1/chat/completions`, SSE).
//!
//! Tool-call fragments stream in keyed by `index`; they are assembled into
//! complete calls and emitted once the model closes the tool-call block (or
//! the stream ends). Usage is requested via `stream_options.include_usage`.

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{
    synthesize_ids, CancelToken, ClientError, EventRx, LineBuffer, LlmClient, Message,
    StreamEvent, ToolCall, ToolSpec, Usage,
};

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        system_prompt: &str,
        conversation: &[Message],
        tools: &[ToolSpec],
        cancel: CancelToken,
    ) -> Result<EventRx, ClientError> {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": build_messages(system_prompt, conversation),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_schema).collect());
            body["tool_choice"] = json!("auto");
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| ClientError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status, text));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut lines = LineBuffer::default();
            let mut asm = Assembler::default();

            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => return, // drop closes the connection
                };
                let bytes = match chunk {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ClientError::Stream(e.to_string()))).await;
                        return;
                    }
                    None => break,
                };
                for line in lines.push(&bytes) {
                    for ev in asm.feed(&line) {
                        if tx.send(Ok(ev)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            for ev in asm.finish() {
                let _ = tx.send(Ok(ev)).await;
            }
        });

        Ok(rx)
    }
}

// ── Request building ──────────────────────────────────────────────────────────

fn tool_schema(t: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        }
    })
}

fn build_messages(system: &str, conversation: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(conversation.len() + 1);
    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }
    for msg in conversation {
        match msg {
            Message::User { content } => {
                out.push(json!({"role": "user", "content": content}));
            }
            Message::Assistant { content, tool_calls } if tool_calls.is_empty() => {
                out.push(json!({"role": "assistant", "content": content}));
            }
            Message::Assistant { content, tool_calls } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments},
                        })
                    })
                    .collect();
                let mut m = json!({"role": "assistant", "tool_calls": calls});
                if !content.is_empty() {
                    m["content"] = json!(content);
                }
                out.push(m);
            }
            Message::ToolResult { tool_call_id, content } => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
            }
        }
    }
    out
}

// ── Stream assembly ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageStats>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageStats {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Default)]
struct Pending {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates SSE lines into stream events. Tool calls are held until the
/// model signals the end of the tool-call block; `Done` fires exactly once.
#[derive(Default)]
struct Assembler {
    pending: Vec<Pending>,
    usage: Usage,
    calls_flushed: bool,
    done: bool,
}

impl Assembler {
    fn feed(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if line == "data: [DONE]" {
            return self.finish();
        }
        let Some(payload) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(usage) = chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens.unwrap_or(0);
            self.usage.output_tokens = usage.completion_tokens.unwrap_or(0);
        }
        for choice in chunk.choices.unwrap_or_default() {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content {
                    if !text.is_empty() {
                        events.push(StreamEvent::Text(text));
                    }
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    while self.pending.len() <= tc.index {
                        self.pending.push(Pending::default());
                    }
                    let entry = &mut self.pending[tc.index];
                    if let Some(id) = tc.id {
                        entry.id = id;
                    }
                    if let Some(func) = tc.function {
                        if let Some(name) = func.name {
                            entry.name.push_str(&name);
                        }
                        if let Some(args) = func.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                events.extend(self.flush_calls());
            }
        }
        events
    }

    fn flush_calls(&mut self) -> Vec<StreamEvent> {
        if self.calls_flushed {
            return Vec::new();
        }
        self.calls_flushed = true;
        let mut calls: Vec<ToolCall> = self
            .pending
            .drain(..)
            .filter(|p| !p.name.is_empty())
            .map(|p| ToolCall { id: p.id, name: p.name, arguments: p.arguments })
            .collect();
        synthesize_ids(&mut calls);
        calls.into_iter().map(StreamEvent::ToolCall).collect()
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut events = self.flush_calls();
        events.push(StreamEvent::Done(self.usage));
        events
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_leads_the_message_array() {
        let msgs = build_messages("be terse", &[Message::user("hi")]);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "be terse");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let conversation = vec![
            Message::assistant(
                "",
                vec![ToolCall { id: "call_0".into(), name: "read".into(), arguments: "{}".into() }],
            ),
            Message::tool_result("call_0", "file contents"),
        ];
        let msgs = build_messages("", &conversation);
        assert_eq!(msgs[0]["tool_calls"][0]["id"], "call_0");
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "read");
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[1]["tool_call_id"], "call_0");
    }

    #[test]
    fn assistant_text_round_trips_without_loss() {
        let msgs = build_messages("", &[Message::assistant("plain answer", vec![])]);
        assert_eq!(msgs[0]["role"], "assistant");
        assert_eq!(msgs[0]["content"], "plain answer");
        assert!(msgs[0].get("tool_calls").is_none());
    }

    #[test]
    fn text_deltas_stream_through() {
        let mut asm = Assembler::default();
        let ev = asm.feed(r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#);
        assert!(matches!(&ev[..], [StreamEvent::Text(t)] if t == "hel"));
    }

    #[test]
    fn tool_call_fragments_assemble_by_index() {
        let mut asm = Assembler::default();
        asm.feed(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read","arguments":"{\"pa"}}]}}]}"#);
        asm.feed(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"x\"}"}}]}}]}"#);
        asm.feed(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"name":"shell","arguments":"{}"}}]}}]}"#);
        let ev = asm.feed(r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);

        let calls: Vec<&ToolCall> = ev
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments, r#"{"path":"x"}"#);
        assert_eq!(calls[1].name, "shell");
        assert_eq!(calls[1].id, "call_1"); // synthesized — provider sent none
    }

    #[test]
    fn usage_chunk_feeds_done_event() {
        let mut asm = Assembler::default();
        asm.feed(r#"data: {"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":34}}"#);
        let ev = asm.feed("data: [DONE]");
        match &ev[..] {
            [StreamEvent::Done(u)] => {
                assert_eq!(u.input_tokens, 120);
                assert_eq!(u.output_tokens, 34);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn done_fires_once_even_when_stream_ends_after_done_marker() {
        let mut asm = Assembler::default();
        let first = asm.feed("data: [DONE]");
        assert_eq!(first.len(), 1);
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn malformed_chunks_are_skipped() {
        let mut asm = Assembler::default();
        assert!(asm.feed("data: {not json").is_empty());
        assert!(asm.feed(": keepalive comment").is_empty());
    }
}
