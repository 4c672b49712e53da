//! Slash-command dispatch.
//!
//! Slash-prefixed input is intercepted before it reaches the agent. Built-ins
//! mutate runtime state (clear, model switch, handover); anything else falls
//! through to the user's command table — markdown files under
//! `.nav/commands/` whose body, with `{input}` substituted, becomes the
//! agent prompt.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::agent::Agent;
use crate::config::ResolvedConfig;
use crate::prompt;
use crate::tui::Ui;

pub enum Outcome {
    /// The command ran; read the next input line.
    Handled,
    /// A custom command expanded into this agent prompt.
    Prompt(String),
    /// Not a slash command at all.
    NotCommand,
}

/// Offered by the bare `/model` picker; anything else can still be typed as
/// `/model <name>`.
const MODEL_MENU: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "o3-mini",
    "claude-sonnet-4-5",
    "claude-haiku-4-5",
    "qwen3:14b",
    "llama3.3:70b",
    "deepseek-r1:14b",
];

/// Split `/name rest...` into its parts.
pub fn parse(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once(char::is_whitespace) {
        Some((name, args)) => Some((name, args.trim())),
        None => Some((rest, "")),
    }
}

pub async fn dispatch(
    line: &str,
    agent: &mut Agent,
    cfg: &mut ResolvedConfig,
    ui: &Arc<dyn Ui>,
    cwd: &Path,
) -> Result<Outcome> {
    let Some((name, args)) = parse(line) else {
        return Ok(Outcome::NotCommand);
    };

    match name {
        "clear" => {
            agent.clear();
            // External prompt inputs may have changed while we were chatting;
            // a clear is the natural point to pick them up.
            let rebuilt = prompt::build(cwd);
            if rebuilt != agent.system_prompt() {
                agent.set_system_prompt(rebuilt);
                ui.info("conversation cleared (system prompt rebuilt)");
            } else {
                ui.info("conversation cleared");
            }
            Ok(Outcome::Handled)
        }
        "model" => {
            // Bare `/model` shows the current model and opens an arrow-key
            // picker; `/model <name>` switches directly.
            let chosen = if args.is_empty() {
                ui.info(&format!("model: {}  ({} @ {})", agent.model(), cfg.provider, cfg.base_url));
                let options: Vec<String> = MODEL_MENU.iter().map(|m| m.to_string()).collect();
                match ui.select("switch model", &options).await {
                    Some(i) => options[i].clone(),
                    None => return Ok(Outcome::Handled),
                }
            } else {
                args.to_string()
            };
            let next = ResolvedConfig::resolve(
                Some(&chosen),
                None, // provider re-detected from the new model name
                None,
                None,
                cfg.verbose,
                cfg.sandbox,
                cfg.enable_handover,
            );
            match next.client() {
                Ok(client) => {
                    agent.set_llm(client);
                    ui.success(&format!("switched to {} ({})", next.model, next.provider));
                    *cfg = next;
                }
                Err(e) => ui.error(&format!("model switch failed: {e}")),
            }
            Ok(Outcome::Handled)
        }
        "handover" => {
            if agent.conversation_len() == 0 {
                ui.error("nothing to hand over — the conversation is empty");
                return Ok(Outcome::Handled);
            }
            let instructions = if args.is_empty() { None } else { Some(args) };
            agent.handover(instructions).await?;
            Ok(Outcome::Handled)
        }
        "help" => {
            ui.info("built-in commands:");
            ui.info("  /clear                  clear conversation history");
            ui.info("  /model [name]           switch the model (bare: arrow-key picker)");
            ui.info("  /handover [notes]       summarize, reset context, continue");
            ui.info("  /help                   this list");
            let custom = list_custom(cwd);
            if !custom.is_empty() {
                ui.info("custom commands (.nav/commands/):");
                for name in custom {
                    ui.info(&format!("  /{name}"));
                }
            }
            Ok(Outcome::Handled)
        }
        other => match load_custom(cwd, other, args) {
            Some(prompt) => Ok(Outcome::Prompt(prompt)),
            None => {
                ui.error(&format!("unknown command: /{other} (try /help)"));
                Ok(Outcome::Handled)
            }
        },
    }
}

// ── Custom command table ──────────────────────────────────────────────────────

fn commands_dir(cwd: &Path) -> std::path::PathBuf {
    cwd.join(".nav").join("commands")
}

/// `/review foo` reads `.nav/commands/review.md` and substitutes `{input}`.
pub fn load_custom(cwd: &Path, name: &str, input: &str) -> Option<String> {
    // Command names come from user input; keep the lookup inside the table.
    if name.contains(['/', '\\', '.']) {
        return None;
    }
    let path = commands_dir(cwd).join(format!("{name}.md"));
    let body = std::fs::read_to_string(path).ok()?;
    Some(body.replace("{input}", input).trim().to_string())
}

pub fn list_custom(cwd: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(commands_dir(cwd)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_suffix(".md").map(str::to_string)
        })
        .collect();
    names.sort();
    names
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_name_and_arguments() {
        assert_eq!(parse("/model gpt-4o"), Some(("model", "gpt-4o")));
        assert_eq!(parse("/clear"), Some(("clear", "")));
        assert_eq!(parse("/handover  focus on tests "), Some(("handover", "focus on tests")));
        assert_eq!(parse("not a command"), None);
        assert_eq!(parse("/"), None);
    }

    #[test]
    fn model_menu_entries_all_resolve_to_a_provider() {
        use crate::config::{detect_provider, Provider};
        let mut seen = std::collections::HashSet::new();
        for entry in MODEL_MENU {
            seen.insert(detect_provider(entry));
        }
        // The picker spans all three backends.
        assert!(seen.contains(&Provider::OpenAi));
        assert!(seen.contains(&Provider::Anthropic));
        assert!(seen.contains(&Provider::Ollama));
    }

    #[test]
    fn custom_commands_substitute_input() {
        let dir = tempfile::tempdir().unwrap();
        let cmd_dir = dir.path().join(".nav/commands");
        std::fs::create_dir_all(&cmd_dir).unwrap();
        std::fs::write(cmd_dir.join("review.md"), "Review this file carefully: {input}\n").unwrap();

        let prompt = load_custom(dir.path(), "review", "src/main.rs").unwrap();
        assert_eq!(prompt, "Review this file carefully: src/main.rs");

        assert!(load_custom(dir.path(), "missing", "").is_none());
        assert_eq!(list_custom(dir.path()), ["review"]);
    }

    #[test]
    fn custom_lookup_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_custom(dir.path(), "../etc/passwd", "").is_none());
        assert!(load_custom(dir.path(), "a.b", "").is_none());
    }

    #[test]
    fn no_commands_dir_means_no_custom_commands() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_custom(dir.path()).is_empty());
    }
}
