//! Anthropic Messages adapter (native API, not an OpenAI proxy).
//!
//! Assistant turns are sequences of content blocks (`text`, `tool_use`);
//! tool results travel back inside a user message as `tool_result` blocks,
//! and consecutive results are coalesced into one such message. Streaming
//! emits `text_delta`s live, accumulates `input_json_delta` fragments per
//! tool-use block, and releases the completed calls at the stream's terminal
//! event. Usage comes from `message_start` / `message_delta`.

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{
    CancelToken, ClientError, EventRx, LineBuffer, LlmClient, Message, StreamEvent, ToolCall,
    ToolSpec, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
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
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
            "messages": build_messages(conversation),
        });
        if !system_prompt.is_empty() {
            body["system"] = json!(system_prompt);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_schema).collect());
        }

        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "text/event-stream")
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
        "name": t.name,
        "description": t.description,
        "input_schema": t.parameters,
    })
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

fn build_messages(conversation: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut results: Vec<Block> = Vec::new();

    let flush_results = |out: &mut Vec<Value>, results: &mut Vec<Block>| {
        if !results.is_empty() {
            let blocks = std::mem::take(results);
            out.push(json!({
                "role": "user",
                "content": serde_json::to_value(blocks).unwrap_or_default(),
            }));
        }
    };

    for msg in conversation {
        match msg {
            Message::ToolResult { tool_call_id, content } => {
                // Consecutive results group into one user message.
                results.push(Block::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: content.clone(),
                });
            }
            Message::User { content } => {
                flush_results(&mut out, &mut results);
                out.push(json!({"role": "user", "content": content}));
            }
            Message::Assistant { content, tool_calls } => {
                flush_results(&mut out, &mut results);
                if tool_calls.is_empty() {
                    out.push(json!({"role": "assistant", "content": content}));
                } else {
                    let mut blocks: Vec<Block> = Vec::new();
                    if !content.is_empty() {
                        blocks.push(Block::Text { text: content.clone() });
                    }
                    for tc in tool_calls {
                        let input: Value =
                            serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
                        blocks.push(Block::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input,
                        });
                    }
                    out.push(json!({
                        "role": "assistant",
                        "content": serde_json::to_value(blocks).unwrap_or_default(),
                    }));
                }
            }
        }
    }
    flush_results(&mut out, &mut results);
    out
}

// ── Stream assembly ───────────────────────────────────────────────────────────

/// Accumulates Anthropic's typed SSE events. Text deltas pass through live;
/// tool-use blocks are collected and released together at `message_stop`.
#[derive(Default)]
struct Assembler {
    current: Option<ToolCall>,
    calls: Vec<ToolCall>,
    usage: Usage,
    done: bool,
}

impl Assembler {
    fn feed(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(n) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens = n as u32;
                }
                Vec::new()
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.seal_current();
                    self.current = Some(ToolCall {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: String::new(),
                    });
                }
                Vec::new()
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => delta["text"]
                        .as_str()
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamEvent::Text(t.to_string())])
                        .unwrap_or_default(),
                    "input_json_delta" => {
                        if let (Some(call), Some(partial)) =
                            (self.current.as_mut(), delta["partial_json"].as_str())
                        {
                            call.arguments.push_str(partial);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                self.seal_current();
                Vec::new()
            }
            "message_delta" => {
                let usage = &event["usage"];
                if let Some(n) = usage["input_tokens"].as_u64() {
                    self.usage.input_tokens = n as u32;
                }
                if let Some(n) = usage["output_tokens"].as_u64() {
                    self.usage.output_tokens = n as u32;
                }
                Vec::new()
            }
            "message_stop" => self.finish(),
            _ => Vec::new(),
        }
    }

    fn seal_current(&mut self) {
        if let Some(mut call) = self.current.take() {
            if call.arguments.is_empty() {
                call.arguments = "{}".to_string();
            }
            self.calls.push(call);
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        self.seal_current();
        let mut events: Vec<StreamEvent> =
            self.calls.drain(..).map(StreamEvent::ToolCall).collect();
        events.push(StreamEvent::Done(self.usage));
        events
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let conversation = vec![Message::assistant(
            "let me look",
            vec![ToolCall {
                id: "toolu_1".into(),
                name: "read".into(),
                arguments: r#"{"path":"a.rs"}"#.into(),
            }],
        )];
        let msgs = build_messages(&conversation);
        let blocks = msgs[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["input"]["path"], "a.rs");
    }

    #[test]
    fn consecutive_tool_results_coalesce_into_one_user_message() {
        let conversation = vec![
            Message::assistant(
                "",
                vec![
                    ToolCall { id: "toolu_1".into(), name: "read".into(), arguments: "{}".into() },
                    ToolCall { id: "toolu_2".into(), name: "shell".into(), arguments: "{}".into() },
                ],
            ),
            Message::tool_result("toolu_1", "one"),
            Message::tool_result("toolu_2", "two"),
            Message::user("thanks"),
        ];
        let msgs = build_messages(&conversation);
        assert_eq!(msgs.len(), 3);
        let blocks = msgs[1]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["tool_use_id"], "toolu_1");
        assert_eq!(blocks[1]["tool_use_id"], "toolu_2");
        assert_eq!(msgs[2]["content"], "thanks");
    }

    #[test]
    fn text_deltas_pass_through_live() {
        let mut asm = Assembler::default();
        let ev = asm.feed(r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#);
        assert!(matches!(&ev[..], [StreamEvent::Text(t)] if t == "hi"));
    }

    #[test]
    fn tool_use_blocks_are_released_at_message_stop() {
        let mut asm = Assembler::default();
        asm.feed(r#"data: {"type":"message_start","message":{"usage":{"input_tokens":50}}}"#);
        asm.feed(r#"data: {"type":"content_block_start","content_block":{"type":"tool_use","id":"toolu_9","name":"edit"}}"#);
        asm.feed(r#"data: {"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{\"path\""}}"#);
        asm.feed(r#"data: {"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":":\"x\"}"}}"#);
        asm.feed(r#"data: {"type":"content_block_stop"}"#);
        asm.feed(r#"data: {"type":"message_delta","usage":{"output_tokens":12}}"#);
        let ev = asm.feed(r#"data: {"type":"message_stop"}"#);

        match &ev[..] {
            [StreamEvent::ToolCall(tc), StreamEvent::Done(u)] => {
                assert_eq!(tc.id, "toolu_9");
                assert_eq!(tc.name, "edit");
                assert_eq!(tc.arguments, r#"{"path":"x"}"#);
                assert_eq!(u.input_tokens, 50);
                assert_eq!(u.output_tokens, 12);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn stream_end_without_message_stop_still_finishes_once() {
        let mut asm = Assembler::default();
        asm.feed(r#"data: {"type":"content_block_start","content_block":{"type":"tool_use","id":"toolu_1","name":"read"}}"#);
        let ev = asm.finish();
        assert_eq!(ev.len(), 2); // sealed call + Done
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn event_name_lines_are_ignored() {
        let mut asm = Assembler::default();
        assert!(asm.feed("event: content_block_delta").is_empty());
    }
}
