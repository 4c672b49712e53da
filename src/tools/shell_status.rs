//! `shell_status` — the reflective view over the process manager.
//!
//! Without a pid it lists every tracked process; with a pid, `action` selects
//! the view: a short status, the full captured output, a byte tail, or kill.

use serde_json::{json, Value};

use super::{ToolContext, ToolResult};

const DEFAULT_TAIL_BYTES: usize = 2048;

pub fn definition() -> Value {
    json!({
        "name": "shell_status",
        "description": "Inspect or manage backgrounded shell commands. With no pid: list all tracked processes. With a pid, action selects the view: status (state + output tail), output (full captured output), tail (last bytes), kill (terminate).",
        "parameters": {
            "type": "object",
            "properties": {
                "pid": { "type": "integer", "description": "Pid of a tracked process (omit to list all)" },
                "action": {
                    "type": "string",
                    "enum": ["status", "output", "tail", "kill"],
                    "description": "What to do with the process (default: status)"
                }
            }
        }
    })
}

pub fn execute(args: &Value, ctx: &ToolContext) -> ToolResult {
    let pm = &ctx.processes;

    let Some(pid) = args["pid"].as_u64().map(|p| p as u32) else {
        let views = pm.list();
        if views.is_empty() {
            return ToolResult::text("No tracked background processes.", "no background processes");
        }
        let mut out = String::new();
        for v in &views {
            out.push_str(&format!("pid {}  {}  {}s  $ {}\n", v.pid, state(v.exit_code), v.elapsed_secs, v.short_command()));
        }
        let summary = format!("{} background process(es)", views.len());
        return ToolResult::text(out, summary);
    };

    let action = args["action"].as_str().unwrap_or("status");
    match action {
        "status" => match pm.view(pid) {
            Some(v) => {
                let tail = pm.status_tail(pid).unwrap_or_default();
                let mut out = format!(
                    "pid {}  {}  started {}s ago\n$ {}\n",
                    v.pid, state(v.exit_code), v.elapsed_secs, v.short_command()
                );
                if !tail.is_empty() {
                    out.push_str("--- output tail ---\n");
                    out.push_str(&tail);
                }
                ToolResult::text(out, format!("pid {pid} {}", state(v.exit_code)))
            }
            None => not_found(pid),
        },
        "output" => match pm.view(pid) {
            Some(v) => {
                let mut out = format!(
                    "pid {}  {}  started {}s ago\n$ {}\n--- output ---\n{}",
                    v.pid, state(v.exit_code), v.elapsed_secs, v.short_command(), v.output
                );
                if v.truncated {
                    out.push_str("\n[output truncated at 256 KiB]");
                }
                ToolResult::text(out, format!("pid {pid} output ({} bytes)", v.output.len()))
            }
            None => not_found(pid),
        },
        "tail" => {
            let n = args["bytes"].as_u64().map(|n| n as usize).unwrap_or(DEFAULT_TAIL_BYTES);
            match pm.tail(pid, n) {
                Some(tail) => ToolResult::text(tail, format!("pid {pid} tail")),
                None => not_found(pid),
            }
        }
        "kill" => {
            if pm.kill(pid) {
                ToolResult::text(format!("Sent terminate signal to pid {pid}."), format!("killed pid {pid}"))
            } else {
                not_found(pid)
            }
        }
        other => ToolResult::error(format!(
            "shell_status: unknown action '{other}' — expected status, output, tail or kill"
        )),
    }
}

fn state(exit_code: Option<i32>) -> String {
    match exit_code {
        None => "running".to_string(),
        Some(code) => format!("exited({code})"),
    }
}

fn not_found(pid: u32) -> ToolResult {
    ToolResult::text(
        format!("No tracked background process with pid {pid}."),
        format!("pid {pid} not found"),
    )
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
    async fn empty_list_is_a_friendly_message() {
        let result = execute(&json!({}), &ctx());
        assert!(result.output.contains("No tracked background processes"));
    }

    #[tokio::test]
    async fn listing_and_status_reflect_a_backgrounded_command() {
        let c = ctx();
        let outcome = c.processes.run("sleep 0.2; echo fin", 10).await.unwrap();

        let list = execute(&json!({}), &c);
        assert!(list.output.contains(&format!("pid {}", outcome.pid)));
        assert!(list.output.contains("running"));

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let status = execute(&json!({"pid": outcome.pid, "action": "status"}), &c);
        assert!(status.output.contains("exited(0)"));
        assert!(status.output.contains("fin"));
    }

    #[tokio::test]
    async fn output_action_returns_the_full_buffer() {
        let c = ctx();
        let outcome = c.processes.run("echo full-output-here", 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let result = execute(&json!({"pid": outcome.pid, "action": "output"}), &c);
        assert!(result.output.contains("full-output-here"));
    }

    #[tokio::test]
    async fn unknown_pid_is_a_text_result() {
        let result = execute(&json!({"pid": 999999999u64, "action": "status"}), &ctx());
        assert!(result.output.contains("No tracked background process"));
    }

    #[tokio::test]
    async fn kill_action_reports_success() {
        let c = ctx();
        let outcome = c.processes.run("sleep 20", 10).await.unwrap();
        let result = execute(&json!({"pid": outcome.pid, "action": "kill"}), &c);
        assert!(result.output.contains("terminate signal"));
    }
}
