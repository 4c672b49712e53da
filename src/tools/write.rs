//! `write` — create or overwrite a whole file.

use serde_json::{json, Value};

use super::{ToolContext, ToolResult};

pub fn definition() -> Value {
    json!({
        "name": "write",
        "description": "Create a new file or overwrite an existing one with the given content. Parent directories are created as needed. Prefer the edit tool for changing existing files.",
        "parameters": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to write" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        }
    })
}

pub fn execute(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(path) = args["path"].as_str() else {
        return ToolResult::error("write: missing 'path'");
    };

    // Some models pass structured content instead of a string; serialise it
    // rather than bouncing the call.
    let content = match &args["content"] {
        Value::String(s) => s.clone(),
        Value::Null => return ToolResult::error("write: missing 'content'"),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };

    let resolved = ctx.resolve(path);
    if let Some(parent) = resolved.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return ToolResult::error(format!("write: cannot create parent dirs for '{path}': {e}"));
        }
    }

    let existed = resolved.exists();
    if let Err(e) = std::fs::write(&resolved, &content) {
        return ToolResult::error(format!("write: cannot write '{path}': {e}"));
    }

    let lines = content.lines().count();
    let verb = if existed { "Overwrote" } else { "Wrote" };
    ToolResult::text(
        format!("{verb} {path} ({} bytes, {lines} lines)", content.len()),
        format!("{} {path} ({lines} lines)", verb.to_lowercase()),
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessManager;

    fn ctx_in(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            cwd: dir.to_path_buf(),
            processes: ProcessManager::new(),
        }
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let args = json!({"path": "deep/nested/f.txt", "content": "hello\n"});
        let result = execute(&args, &ctx_in(dir.path()));
        assert!(result.output.starts_with("Wrote"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("deep/nested/f.txt")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn overwrite_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "old").unwrap();
        let result = execute(&json!({"path": "f.txt", "content": "new"}), &ctx_in(dir.path()));
        assert!(result.output.starts_with("Overwrote"));
    }

    #[test]
    fn object_content_is_serialised_as_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let args = json!({"path": "cfg.json", "content": {"a": 1}});
        execute(&args, &ctx_in(dir.path()));
        let written = std::fs::read_to_string(dir.path().join("cfg.json")).unwrap();
        assert!(written.contains("\"a\": 1"));
    }

    #[test]
    fn missing_content_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(&json!({"path": "f.txt"}), &ctx_in(dir.path()));
        assert!(result.output.contains("missing 'content'"));
    }
}
