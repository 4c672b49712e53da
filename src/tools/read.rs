//! `read` — emit a file in hashline display form.
//!
//! Every line is prefixed `LINE:HH|` so the model holds valid anchors for the
//! edit tool. Reads are windowed by `offset`/`limit` and capped in both lines
//! and bytes; a continuation hint tells the model how to fetch the rest.

use serde_json::{json, Value};

use super::{ToolContext, ToolResult};
use crate::hashline;

/// Most lines returned by a single read.
pub const MAX_LINES: usize = 2000;
/// Byte cap on a single read's output content.
pub const MAX_BYTES: usize = 256 * 1024;

pub fn definition() -> Value {
    json!({
        "name": "read",
        "description": "Read a file. Output lines are `LINE:HASH|content` — the LINE:HASH pair is the anchor the edit tool requires, so always read a file before editing it. Large files are windowed: pass offset (1-based line) and limit to page through.",
        "parameters": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to read" },
                "offset": { "type": "integer", "description": "1-based line to start from (default 1)" },
                "limit": { "type": "integer", "description": "Max lines to return (default and cap 2000)" }
            },
            "required": ["path"]
        }
    })
}

pub fn execute(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(path) = args["path"].as_str() else {
        return ToolResult::error("read: missing 'path'");
    };
    let resolved = ctx.resolve(path);

    if resolved.is_dir() {
        return ToolResult::error(format!(
            "read: '{path}' is a directory — use the shell tool to list it (e.g. `ls {path}`)"
        ));
    }

    let content = match std::fs::read_to_string(&resolved) {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("read: cannot read '{path}': {e}")),
    };

    let offset = args["offset"].as_u64().map(|n| n.max(1) as usize).unwrap_or(1);
    let limit = args["limit"]
        .as_u64()
        .map(|n| (n as usize).min(MAX_LINES))
        .filter(|n| *n > 0)
        .unwrap_or(MAX_LINES);

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    if offset > total && total > 0 {
        return ToolResult::error(format!(
            "read: offset {offset} is past the end of '{path}' ({total} lines)"
        ));
    }

    let start = offset - 1;
    let mut out = String::new();
    let mut emitted = 0usize;
    let mut truncated_bytes = false;
    for (i, line) in lines.iter().enumerate().skip(start).take(limit) {
        let display = hashline::format_line(i + 1, line);
        if out.len() + display.len() > MAX_BYTES {
            truncated_bytes = true;
            break;
        }
        out.push_str(&display);
        emitted += 1;
    }

    let end = start + emitted;
    if truncated_bytes {
        out.push_str(&format!(
            "[output truncated at {} KiB. Use offset={} to continue]\n",
            MAX_BYTES / 1024,
            end + 1
        ));
    } else if end < total {
        out.push_str(&format!(
            "[{} more lines. Use offset={} to continue]\n",
            total - end,
            end + 1
        ));
    }
    if total == 0 {
        out.push_str("[empty file]\n");
    }

    ToolResult::text(out, format!("read {path} ({emitted} of {total} lines)"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessManager;
    use std::io::Write as _;

    fn ctx_in(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            cwd: dir.to_path_buf(),
            processes: ProcessManager::new(),
        }
    }

    #[test]
    fn small_file_comes_back_whole_with_anchors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "foo\nbar\nbaz\n").unwrap();
        let result = execute(&json!({"path": "f.txt"}), &ctx_in(dir.path()));

        let lines: Vec<&str> = result.output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("1:"));
        assert!(lines[0].ends_with("|foo"));
        assert!(lines[2].ends_with("|baz"));
    }

    #[test]
    fn offset_and_limit_window_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=50).map(|i| format!("line{i}\n")).collect();
        std::fs::write(dir.path().join("f.txt"), content).unwrap();

        let result = execute(&json!({"path": "f.txt", "offset": 10, "limit": 5}), &ctx_in(dir.path()));
        let lines: Vec<&str> = result.output.lines().collect();
        assert!(lines[0].starts_with("10:"));
        assert!(lines[4].starts_with("14:"));
        assert_eq!(lines[5], "[36 more lines. Use offset=15 to continue]");
    }

    #[test]
    fn directories_are_rejected_with_a_shell_hint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let result = execute(&json!({"path": "sub"}), &ctx_in(dir.path()));
        assert!(result.output.contains("is a directory"));
        assert!(result.output.contains("shell"));
    }

    #[test]
    fn missing_file_is_a_tool_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(&json!({"path": "nope.txt"}), &ctx_in(dir.path()));
        assert!(result.output.contains("cannot read"));
    }

    #[test]
    fn byte_cap_truncates_with_notice() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("big.txt")).unwrap();
        let long_line = "x".repeat(1000);
        for _ in 0..500 {
            writeln!(f, "{long_line}").unwrap();
        }
        let result = execute(&json!({"path": "big.txt"}), &ctx_in(dir.path()));
        assert!(result.output.len() <= MAX_BYTES + 128);
        assert!(result.output.contains("output truncated"));
    }

    #[test]
    fn empty_file_is_labelled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("e.txt"), "").unwrap();
        let result = execute(&json!({"path": "e.txt"}), &ctx_in(dir.path()));
        assert!(result.output.contains("[empty file]"));
    }
}
