//! `shell` — run a command with a foreground wait budget.
//!
//! Commands that outlive `wait_ms` are not killed: the process manager keeps
//! them running in the background and the model is told the pid to poll with
//! `shell_status`.

use serde_json::{json, Value};

use super::{ToolContext, ToolResult};

pub const DEFAULT_WAIT_MS: u64 = 30_000;

pub fn definition() -> Value {
    json!({
        "name": "shell",
        "description": "Run a shell command in the project directory. Waits up to wait_ms (default 30000) for completion; a command still running after that is moved to the background and its pid returned — check on it with shell_status. Pass wait_ms: 0 to background immediately (e.g. for servers).",
        "parameters": {
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command passed to sh -c" },
                "wait_ms": { "type": "integer", "description": "Foreground wait budget in milliseconds (default 30000, 0 = background immediately)" }
            },
            "required": ["command"]
        }
    })
}

pub async fn execute(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(command) = args["command"].as_str() else {
        return ToolResult::error("shell: missing 'command'");
    };
    let wait_ms = args["wait_ms"].as_u64().unwrap_or(DEFAULT_WAIT_MS);

    let outcome = match ctx.processes.run(command, wait_ms).await {
        Ok(o) => o,
        Err(e) => return ToolResult::error(format!("shell: {e:#}")),
    };

    let summary = format!("$ {}", first_line(command, 60));
    if outcome.completed {
        let mut output = outcome.output;
        if output.is_empty() {
            output = "[no output]".to_string();
        }
        if outcome.truncated {
            output.push_str("\n[output truncated at 256 KiB]");
        }
        ToolResult::text(output, summary)
    } else {
        let mut output = format!(
            "Command still running after {wait_ms} ms — backgrounded with pid {}.\n\
             Use shell_status with pid={} to check on it.\n",
            outcome.pid, outcome.pid
        );
        if !outcome.output.is_empty() {
            output.push_str("Output so far:\n");
            output.push_str(&outcome.output);
        }
        ToolResult::text(output, format!("{summary}  [backgrounded pid {}]", outcome.pid))
    }
}

fn first_line(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or(s);
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max - 1).collect();
        format!("{cut}…")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessManager;

    fn ctx() -> ToolContext {
        ToolContext {
            cwd: std::env::temp_dir(),
            processes: ProcessManager::new(),
        }
    }

    #[tokio::test]
    async fn fast_command_returns_its_output() {
        let result = execute(&json!({"command": "echo hi", "wait_ms": 2000}), &ctx()).await;
        assert!(result.output.contains("hi"));
        assert!(result.display_summary.starts_with("$ echo hi"));
    }

    #[tokio::test]
    async fn slow_command_reports_its_pid() {
        let result = execute(&json!({"command": "sleep 5", "wait_ms": 10}), &ctx()).await;
        assert!(result.output.contains("backgrounded with pid"));
        assert!(result.display_summary.contains("backgrounded"));
    }

    #[tokio::test]
    async fn empty_output_is_labelled() {
        let result = execute(&json!({"command": "true", "wait_ms": 2000}), &ctx()).await;
        assert_eq!(result.output, "[no output]");
    }
}
