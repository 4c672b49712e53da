//! Append-only JSONL session log under `.nav/logs/`.
//!
//! One object per line: `{type, timestamp, data}`. Logging is best-effort —
//! a full disk or missing permissions never interrupts a session.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::client::{Message, ToolCall, Usage};

/// Tool results are clipped to this many chars in the log.
const TOOL_RESULT_LOG_CAP: usize = 5000;

pub struct SessionLogger {
    file: Option<Mutex<File>>,
    pub path: PathBuf,
}

impl SessionLogger {
    /// Open `<cwd>/.nav/logs/<timestamp>.jsonl`, creating directories as
    /// needed. Failure to open yields a logger that silently drops records.
    pub fn open(cwd: &Path) -> Self {
        let dir = cwd.join(".nav").join("logs");
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{stamp}.jsonl"));
        let file = std::fs::create_dir_all(&dir)
            .ok()
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path).ok())
            .map(Mutex::new);
        Self { file, path }
    }

    /// A logger that records nothing (one-shot runs in unwritable dirs).
    pub fn disabled() -> Self {
        Self { file: None, path: PathBuf::new() }
    }

    fn record(&self, kind: &str, data: Value) {
        let Some(file) = &self.file else { return };
        let line = json!({
            "type": kind,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": data,
        });
        if let Ok(mut f) = file.lock() {
            let _ = writeln!(f, "{line}");
        }
    }

    pub fn config(&self, data: Value) {
        self.record("config", data);
    }

    pub fn system_prompt(&self, prompt: &str) {
        self.record("system_prompt", json!({"content": prompt}));
    }

    pub fn user_message(&self, content: &str) {
        self.record("user_message", json!({"content": content}));
    }

    pub fn assistant_message(&self, content: &str, tool_calls: &[ToolCall]) {
        self.record(
            "assistant_message",
            json!({"content": content, "tool_calls": tool_calls}),
        );
    }

    pub fn tool_call(&self, call: &ToolCall) {
        self.record(
            "tool_call",
            json!({"id": call.id, "name": call.name, "arguments": call.arguments}),
        );
    }

    pub fn tool_result(&self, tool_call_id: &str, content: &str) {
        self.record(
            "tool_result",
            json!({"tool_call_id": tool_call_id, "content": clip(content, TOOL_RESULT_LOG_CAP)}),
        );
    }

    pub fn error(&self, message: &str) {
        self.record("error", json!({"message": message}));
    }

    pub fn usage(&self, usage: Usage) {
        self.record(
            "usage",
            json!({"input_tokens": usage.input_tokens, "output_tokens": usage.output_tokens}),
        );
    }

    /// Log one conversation message with the record type matching its role.
    pub fn message(&self, msg: &Message) {
        match msg {
            Message::User { content } => self.user_message(content),
            Message::Assistant { content, tool_calls } => {
                self.assistant_message(content, tool_calls)
            }
            Message::ToolResult { tool_call_id, content } => {
                self.tool_result(tool_call_id, content)
            }
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}… [truncated]")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::open(dir.path());
        logger.user_message("hello");
        logger.usage(Usage { input_tokens: 10, output_tokens: 2 });

        let content = std::fs::read_to_string(&logger.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "user_message");
        assert_eq!(first["data"]["content"], "hello");
        assert!(first["timestamp"].is_string());
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["data"]["input_tokens"], 10);
    }

    #[test]
    fn tool_results_are_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::open(dir.path());
        let big = "y".repeat(TOOL_RESULT_LOG_CAP + 500);
        logger.tool_result("call_0", &big);

        let content = std::fs::read_to_string(&logger.path).unwrap();
        let rec: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        let logged = rec["data"]["content"].as_str().unwrap();
        assert!(logged.chars().count() < big.chars().count());
        assert!(logged.ends_with("[truncated]"));
    }

    #[test]
    fn disabled_logger_drops_records_quietly() {
        let logger = SessionLogger::disabled();
        logger.error("nothing to see");
    }
}
