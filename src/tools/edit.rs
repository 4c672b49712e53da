//! `edit` — anchor-validated file mutation.
//!
//! The payload is a batch of edits whose anchors all refer to the file as it
//! was last read. Models disagree on the payload shape, so both the nested
//! form `{"set_line": {...}}` and the flat form `{"type": "set_line", ...}`
//! are accepted and normalised before the engine runs. A successful edit
//! returns the diff plus fresh hashlines around the change so the model can
//! keep editing without another read.

use serde_json::{json, Value};

use super::{ToolContext, ToolResult};
use crate::diff;
use crate::hashline::{self, EditOp};

/// Context lines echoed around a change in the post-edit excerpt.
const ECHO_CONTEXT: usize = 3;

pub fn definition() -> Value {
    json!({
        "name": "edit",
        "description": "Edit a file using anchors from a previous read. Each edit is one of: set_line {anchor, new_text} (replace one line; new_text may be multiple lines; empty deletes), replace_lines {start_anchor, end_anchor, new_text} (replace an inclusive range), insert_after {anchor, text} (insert after a line). Anchors are the LINE:HASH pairs from read output and must all refer to the file state at the time of the read — the result echoes updated anchors around the change for follow-up edits.",
        "parameters": {
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to edit" },
                "edits": {
                    "type": "array",
                    "description": "Batch of edit operations, all anchored to the pre-edit file state",
                    "items": { "type": "object" }
                }
            },
            "required": ["path", "edits"]
        }
    })
}

pub fn execute(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(path) = args["path"].as_str() else {
        return ToolResult::error("edit: missing 'path'");
    };
    // A bare object where an array belongs is a common model slip; take it
    // as a batch of one.
    let single;
    let raw_edits: &[Value] = match &args["edits"] {
        Value::Array(list) => list,
        obj @ Value::Object(_) => {
            single = [obj.clone()];
            &single
        }
        _ => return ToolResult::error("edit: missing 'edits' array"),
    };
    if raw_edits.is_empty() {
        return ToolResult::error("edit: 'edits' is empty");
    }

    let mut edits = Vec::with_capacity(raw_edits.len());
    for (i, raw) in raw_edits.iter().enumerate() {
        match parse_edit(raw) {
            Ok(op) => edits.push(op),
            Err(e) => return ToolResult::error(format!("edit: edits[{i}]: {e}")),
        }
    }

    let resolved = ctx.resolve(path);
    let old = match std::fs::read_to_string(&resolved) {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("edit: cannot read '{path}': {e}")),
    };

    let new = match hashline::apply_edits(&old, &edits) {
        Ok(content) => content,
        Err(e) => return ToolResult::error(format!("edit: {e}")),
    };

    if let Err(e) = std::fs::write(&resolved, &new) {
        return ToolResult::error(format!("edit: cannot write '{path}': {e}"));
    }

    let stats = diff::stats(&old, &new);
    let unified = diff::unified(&old, &new, 3);

    let mut output = format!("Edited {path} ({stats})\n\n{unified}");
    if let Some(excerpt) = post_edit_excerpt(&old, &new) {
        output.push_str("\nUpdated anchors around the change:\n");
        output.push_str(&excerpt);
    }

    ToolResult {
        output,
        display_summary: format!("edited {path} ({stats})"),
        display_diff: Some(unified),
    }
}

// ── Shape normalisation ───────────────────────────────────────────────────────

fn parse_edit(raw: &Value) -> Result<EditOp, String> {
    // Flat form: {"type": "set_line", "anchor": ..., ...}
    if let Some(kind) = raw["type"].as_str() {
        return build_edit(kind, raw);
    }
    // Nested form: {"set_line": {...}}
    for kind in ["set_line", "replace_lines", "insert_after"] {
        if raw[kind].is_object() {
            return build_edit(kind, &raw[kind]);
        }
    }
    Err("unrecognised edit shape — expected {\"set_line\": {...}}, \
         {\"replace_lines\": {...}}, {\"insert_after\": {...}} or the flat \
         form with a \"type\" field"
        .to_string())
}

fn build_edit(kind: &str, fields: &Value) -> Result<EditOp, String> {
    let anchor = |key: &str| -> Result<hashline::Anchor, String> {
        let raw = fields[key]
            .as_str()
            .ok_or_else(|| format!("{kind}: missing '{key}'"))?;
        hashline::parse_anchor(raw).map_err(|e| e.to_string())
    };
    let text = |key: &str| -> String {
        match &fields[key] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    };

    match kind {
        "set_line" => Ok(EditOp::SetLine {
            anchor: anchor("anchor")?,
            new_text: text("new_text"),
        }),
        "replace_lines" => Ok(EditOp::ReplaceLines {
            start_anchor: anchor("start_anchor")?,
            end_anchor: anchor("end_anchor")?,
            new_text: text("new_text"),
        }),
        "insert_after" => Ok(EditOp::InsertAfter {
            anchor: anchor("anchor")?,
            text: text("text"),
        }),
        other => Err(format!("unknown edit type '{other}'")),
    }
}

// ── Post-edit anchor echo ─────────────────────────────────────────────────────

/// Fresh display lines for each changed region of the new content, so the
/// model can chain edits without a re-read.
fn post_edit_excerpt(old: &str, new: &str) -> Option<String> {
    let new_lines: Vec<&str> = new.lines().collect();
    let ranges = diff::changed_new_ranges(old, new, ECHO_CONTEXT);
    if new_lines.is_empty() || ranges.is_empty() {
        return None;
    }

    let mut out = String::new();
    for (i, (lo, hi)) in ranges.iter().enumerate() {
        if i > 0 {
            out.push_str("...\n");
        }
        for line_no in *lo..=*hi {
            out.push_str(&hashline::format_line(line_no, new_lines[line_no - 1]));
        }
    }
    Some(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashline::line_hash;
    use crate::process::ProcessManager;

    fn ctx_in(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            cwd: dir.to_path_buf(),
            processes: ProcessManager::new(),
        }
    }

    fn anchor(content: &str, line: usize) -> String {
        let text = content.lines().nth(line - 1).unwrap();
        format!("{line}:{}", line_hash(text))
    }

    #[test]
    fn nested_shape_applies_and_echoes_fresh_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let content = "foo\nbar\nbaz\n";
        let path = dir.path().join("f.txt");
        std::fs::write(&path, content).unwrap();

        let args = json!({
            "path": "f.txt",
            "edits": [
                {"replace_lines": {
                    "start_anchor": anchor(content, 2),
                    "end_anchor": anchor(content, 2),
                    "new_text": "BAR"
                }}
            ]
        });
        let result = execute(&args, &ctx_in(dir.path()));

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo\nBAR\nbaz\n");
        assert!(result.display_summary.contains("+1, -1"));
        assert!(result.output.contains("-bar"));
        assert!(result.output.contains("+BAR"));
        assert!(result.output.contains(&format!("2:{}|BAR", line_hash("BAR"))));
        assert!(result.display_diff.is_some());
    }

    #[test]
    fn flat_shape_is_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let content = "a\nb\n";
        let path = dir.path().join("f.txt");
        std::fs::write(&path, content).unwrap();

        let args = json!({
            "path": "f.txt",
            "edits": [
                {"type": "insert_after", "anchor": anchor(content, 1), "text": "between"}
            ]
        });
        execute(&args, &ctx_in(dir.path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nbetween\nb\n");
    }

    #[test]
    fn stale_anchor_leaves_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "foo\nqux\nbaz\n").unwrap();

        // Anchor computed against the old line "bar".
        let args = json!({
            "path": "f.txt",
            "edits": [
                {"set_line": {"anchor": format!("2:{}", line_hash("bar")), "new_text": "BAR"}}
            ]
        });
        let result = execute(&args, &ctx_in(dir.path()));

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo\nqux\nbaz\n");
        assert!(result.output.contains(">>>"));
        assert!(result.output.contains("qux"));
    }

    #[test]
    fn bare_edit_object_is_taken_as_a_batch_of_one() {
        let dir = tempfile::tempdir().unwrap();
        let content = "a\nb\n";
        let path = dir.path().join("f.txt");
        std::fs::write(&path, content).unwrap();

        let args = json!({
            "path": "f.txt",
            "edits": {"set_line": {"anchor": anchor(content, 2), "new_text": "B"}}
        });
        execute(&args, &ctx_in(dir.path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nB\n");
    }

    #[test]
    fn bad_edit_shape_reports_the_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x\n").unwrap();
        let args = json!({"path": "f.txt", "edits": [{"frobnicate": {}}]});
        let result = execute(&args, &ctx_in(dir.path()));
        assert!(result.output.contains("edits[0]"));
        assert!(result.output.contains("unrecognised edit shape"));
    }

    #[test]
    fn noop_edit_tells_the_model_to_reread() {
        let dir = tempfile::tempdir().unwrap();
        let content = "same\n";
        std::fs::write(dir.path().join("f.txt"), content).unwrap();
        let args = json!({
            "path": "f.txt",
            "edits": [{"set_line": {"anchor": anchor(content, 1), "new_text": "same"}}]
        });
        let result = execute(&args, &ctx_in(dir.path()));
        assert!(result.output.contains("no change"));
    }
}
