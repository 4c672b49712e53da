//! Ollama native adapter (`/api/chat`, NDJSON).
//!
//! Ollama's dialect differs from OpenAI's in three ways this adapter papers
//! over: tool results are a `tool` role carrying `tool_name` instead of a
//! call id, tool calls arrive complete (never as deltas) and without ids, and
//! usage comes from the final chunk's `prompt_eval_count` / `eval_count`.
//! Ids are synthesized (`call_N`) on the way out; `tool_name` is recovered on
//! the way in from an id→name table over the conversation's assistant turns.

use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::{
    CancelToken, ClientError, EventRx, LineBuffer, LlmClient, Message, StreamEvent, ToolCall,
    ToolSpec, Usage,
};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for OllamaClient {
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
            "messages": build_messages(system_prompt, conversation),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_schema).collect());
        }

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

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
                    _ = cancel.cancelled() => return,
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
    // Tool results carry names, not ids, in Ollama's dialect.
    let mut names: HashMap<&str, &str> = HashMap::new();
    for msg in conversation {
        if let Message::Assistant { tool_calls, .. } = msg {
            for tc in tool_calls {
                names.insert(tc.id.as_str(), tc.name.as_str());
            }
        }
    }

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
                        let args: Value =
                            serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
                        json!({"function": {"name": tc.name, "arguments": args}})
                    })
                    .collect();
                out.push(json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": calls,
                }));
            }
            Message::ToolResult { tool_call_id, content } => {
                out.push(json!({
                    "role": "tool",
                    "tool_name": names.get(tool_call_id.as_str()).copied().unwrap_or(""),
                    "content": content,
                }));
            }
        }
    }
    out
}

// ── Stream assembly ───────────────────────────────────────────────────────────

/// Parses NDJSON chunks. Tool calls arrive whole, so they are emitted as soon
/// as they appear, with `call_N` ids numbered across the response.
#[derive(Default)]
struct Assembler {
    next_call: usize,
    usage: Usage,
    done: bool,
}

impl Assembler {
    fn feed(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(text) = chunk["message"]["content"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::Text(text.to_string()));
            }
        }
        if let Some(calls) = chunk["message"]["tool_calls"].as_array() {
            for call in calls {
                let name = call["function"]["name"].as_str().unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                let arguments = call["function"]["arguments"].to_string();
                events.push(StreamEvent::ToolCall(ToolCall {
                    id: format!("call_{}", self.next_call),
                    name: name.to_string(),
                    arguments,
                }));
                self.next_call += 1;
            }
        }
        if chunk["done"].as_bool().unwrap_or(false) {
            if let Some(n) = chunk["prompt_eval_count"].as_u64() {
                self.usage.input_tokens = n as u32;
            }
            if let Some(n) = chunk["eval_count"].as_u64() {
                self.usage.output_tokens = n as u32;
            }
            events.extend(self.finish());
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![StreamEvent::Done(self.usage)]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
