//! System prompt assembly.
//!
//! The prompt is built once at startup and treated as immutable for the life
//! of the process: provider KV caches are keyed on the exact request prefix,
//! so handovers and clears reuse the same bytes. It is rebuilt only when the
//! effective conventions file changes on disk between turns, which the main
//! loop detects through `conventions_fingerprint`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const BASE: &str = "\
You are nav, a focused coding agent. You work on the user's project with the \
available tools.

Guidelines:
- Always read a file before editing it. The read tool prefixes every line \
with `LINE:HASH|` — that LINE:HASH pair is the anchor the edit tool requires.
- Anchors refer to the file as it was when you read it. If an edit fails \
with an anchor mismatch, the corrected anchors are in the error — copy them \
and retry; re-read only if the error tells you to.
- After a successful edit the result echoes fresh anchors around the change. \
Use those for follow-up edits instead of re-reading.
- Use write only for brand-new files; use edit for existing ones.
- Shell commands that outlive their wait budget keep running in the \
background — poll them with shell_status instead of re-running them.
- Verify changes compile or pass tests before declaring them done.
- When the task is complete, say so clearly and stop calling tools.";

/// Assemble the full prompt: base instructions, a shallow per-directory map
/// of the project, and the project's conventions file when one exists.
pub fn build(cwd: &Path) -> String {
    let mut sections = vec![BASE.to_string()];
    if let Some(layout) = layout_section(cwd) {
        sections.push(layout);
    }
    if let Some((name, text)) = conventions_file(cwd) {
        sections.push(format!("# Project conventions\n\nFrom {name}:\n\n{text}"));
    }
    sections.join("\n\n")
}

// ── Conventions ───────────────────────────────────────────────────────────────

/// Where projects keep their working agreements, in lookup order. Only the
/// first non-empty file is used.
const CONVENTION_FILES: &[&str] = &["AGENTS.md", "CLAUDE.md"];

fn conventions_file(cwd: &Path) -> Option<(&'static str, String)> {
    CONVENTION_FILES.iter().find_map(|name| {
        let text = std::fs::read_to_string(cwd.join(name)).ok()?;
        let text = text.trim();
        (!text.is_empty()).then(|| (*name, text.to_string()))
    })
}

/// Fingerprint of the conventions file the prompt actually embeds. The main
/// loop compares this between turns; a change is the one event that justifies
/// breaking the KV cache with a prompt rebuild.
pub fn conventions_fingerprint(cwd: &Path) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Some((name, text)) = conventions_file(cwd) {
        name.hash(&mut hasher);
        text.hash(&mut hasher);
    }
    hasher.finish()
}

// ── Project layout ────────────────────────────────────────────────────────────

/// How many directories the map may describe.
const DIR_CAP: usize = 20;
/// How many entries a single directory line may name before eliding.
const ENTRY_CAP: usize = 12;
/// How deep below the root the walk descends.
const MAX_DEPTH: usize = 2;

const SKIP_DIRS: &[&str] = &[
    "target", "node_modules", "dist", "build", "out", "__pycache__", "venv", "coverage", "vendor",
];

const SOURCE_EXTS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "go", "c", "h", "cpp", "hpp", "java", "rb", "php",
    "swift", "kt", "zig", "ex", "hs",
];

/// One line per directory, breadth-first from the root:
///
/// ```text
/// ./: Cargo.toml, src/
/// src/: agent.rs, client/, main.rs (+3 more)
/// ```
///
/// Emitted only when the walk saw at least one source file, so running in a
/// downloads folder doesn't pour noise into the prompt.
fn layout_section(cwd: &Path) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut saw_source = false;
    let mut pending: VecDeque<(PathBuf, usize)> = VecDeque::from([(cwd.to_path_buf(), 0)]);

    while let Some((dir, depth)) = pending.pop_front() {
        if lines.len() == DIR_CAP {
            break;
        }
        let Some(entries) = dir_entries(&dir) else { continue };
        if entries.is_empty() {
            continue;
        }

        for (name, is_dir) in &entries {
            if *is_dir && depth < MAX_DEPTH {
                pending.push_back((dir.join(name.trim_end_matches('/')), depth + 1));
            }
            if !is_dir {
                if let Some(ext) = name.rsplit_once('.').map(|(_, e)| e) {
                    saw_source |= SOURCE_EXTS.contains(&ext);
                }
            }
        }

        let label = match dir.strip_prefix(cwd) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => continue,
        };
        let shown: Vec<&str> = entries.iter().take(ENTRY_CAP).map(|(n, _)| n.as_str()).collect();
        let elided = entries.len() - shown.len();
        let mut line = format!("{label}/: {}", shown.join(", "));
        if elided > 0 {
            line.push_str(&format!(" (+{elided} more)"));
        }
        lines.push(line);
    }

    if !saw_source || lines.is_empty() {
        return None;
    }
    Some(format!("# Project layout\n\n{}", lines.join("\n")))
}

/// Visible entries of one directory, name-sorted, directories marked with a
/// trailing slash. `None` when the directory can't be read.
fn dir_entries(dir: &Path) -> Option<Vec<(String, bool)>> {
    let read = std::fs::read_dir(dir).ok()?;
    let mut entries: Vec<(String, bool)> = read
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && SKIP_DIRS.contains(&name.as_str()) {
                return None;
            }
            Some(if is_dir { (format!("{name}/"), true) } else { (name, false) })
        })
        .collect();
    entries.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));
    Some(entries)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_is_deterministic_for_a_fixed_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let a = build(dir.path());
        let b = build(dir.path());
        assert_eq!(a, b);
        assert!(a.contains("./: Cargo.toml, src/"));
        assert!(a.contains("src/: main.rs"));
    }

    #[test]
    fn crowded_directories_are_elided_per_line() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..ENTRY_CAP + 3 {
            std::fs::write(dir.path().join(format!("m{i:02}.rs")), "").unwrap();
        }
        let section = layout_section(dir.path()).unwrap();
        assert!(section.contains("(+3 more)"));
        assert!(!section.contains(&format!("m{:02}.rs", ENTRY_CAP + 2)));
    }

    #[test]
    fn noise_and_hidden_directories_stay_out_of_the_map() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();

        let section = layout_section(dir.path()).unwrap();
        assert!(!section.contains("target"));
        assert!(!section.contains(".git"));
    }

    #[test]
    fn conventions_are_appended_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Use tabs.").unwrap();
        let prompt = build(dir.path());
        assert!(prompt.contains("From AGENTS.md:"));
        assert!(prompt.contains("Use tabs."));
    }

    #[test]
    fn non_project_dirs_skip_the_map() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("random.txt"), "x").unwrap();
        assert!(layout_section(dir.path()).is_none());
        assert!(!build(dir.path()).contains("# Project layout"));
    }

    #[test]
    fn fingerprint_tracks_the_effective_conventions_file() {
        let dir = tempfile::tempdir().unwrap();
        let before = conventions_fingerprint(dir.path());
        std::fs::write(dir.path().join("CLAUDE.md"), "Prefer small functions.").unwrap();
        let with_fallback = conventions_fingerprint(dir.path());
        assert_ne!(before, with_fallback);

        // AGENTS.md shadows CLAUDE.md, so adding it changes the print again.
        std::fs::write(dir.path().join("AGENTS.md"), "Use tabs.").unwrap();
        let with_primary = conventions_fingerprint(dir.path());
        assert_ne!(with_fallback, with_primary);
        assert_eq!(with_primary, conventions_fingerprint(dir.path()));
    }
}
