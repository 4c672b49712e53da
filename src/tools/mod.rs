//! The tool registry: five named operations with JSON-schema parameters and a
//! uniform result shape.
//!
//! Tool failures never abort the process — every error is folded into the
//! result text so the model can read it and adapt. The unified schemas here
//! are rendered into each provider's dialect by the client adapters.

pub mod edit;
pub mod read;
pub mod shell;
pub mod shell_status;
pub mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::client::ToolSpec;
use crate::process::ProcessManager;

/// What a tool hands back: the full output for the model, a one-line summary
/// for the transcript, and optionally a diff for the TUI to render.
#[derive(Debug)]
pub struct ToolResult {
    pub output: String,
    pub display_summary: String,
    pub display_diff: Option<String>,
}

impl ToolResult {
    pub fn text(output: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            display_summary: summary.into(),
            display_diff: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let summary = message.lines().next().unwrap_or("error").to_string();
        Self {
            output: message,
            display_summary: summary,
            display_diff: None,
        }
    }
}

/// Shared state handed to every tool invocation.
pub struct ToolContext {
    pub cwd: PathBuf,
    pub processes: Arc<ProcessManager>,
}

impl ToolContext {
    /// Resolve a model-supplied path against the project directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }
}

/// All tool definitions, in the order they are presented to the model.
pub fn definitions() -> Vec<ToolSpec> {
    vec![
        spec(read::definition()),
        spec(edit::definition()),
        spec(write::definition()),
        spec(shell::definition()),
        spec(shell_status::definition()),
    ]
}

fn spec(v: Value) -> ToolSpec {
    ToolSpec {
        name: v["name"].as_str().unwrap_or("").to_string(),
        description: v["description"].as_str().unwrap_or("").to_string(),
        parameters: v["parameters"].clone(),
    }
}

/// Dispatch one tool call by name. Unknown names come back as a plain text
/// result the model can react to.
pub async fn dispatch(name: &str, args: &Value, ctx: &ToolContext) -> ToolResult {
    match name {
        "read" => read::execute(args, ctx),
        "edit" => edit::execute(args, ctx),
        "write" => write::execute(args, ctx),
        "shell" => shell::execute(args, ctx).await,
        "shell_status" => shell_status::execute(args, ctx),
        other => ToolResult::text(format!("Unknown tool: {other}"), format!("unknown tool {other}")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            cwd: std::env::temp_dir(),
            processes: ProcessManager::new(),
        }
    }

    #[test]
    fn definitions_cover_the_five_operations() {
        let names: Vec<String> = definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["read", "edit", "write", "shell", "shell_status"]);
    }

    #[test]
    fn every_definition_has_an_object_schema() {
        for d in definitions() {
            assert_eq!(d.parameters["type"], "object", "{} schema", d.name);
            assert!(!d.description.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_text_result_not_an_error() {
        let result = dispatch("teleport", &serde_json::json!({}), &ctx()).await;
        assert_eq!(result.output, "Unknown tool: teleport");
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let c = ctx();
        assert!(c.resolve("foo.rs").starts_with(&c.cwd));
        assert_eq!(c.resolve("/abs/foo.rs"), PathBuf::from("/abs/foo.rs"));
    }
}
