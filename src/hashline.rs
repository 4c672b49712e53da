/// Hashline engine — anchor-based, race-safe line editing.
///
/// Files are presented to the model as `LINE:HH|content` where `HH` is a
/// two-hex-char digest of the line with all whitespace removed. Edits name
/// their targets by `(line, hash)` anchors; every anchor is validated against
/// the current file state before a single byte is written, so stale edits
/// fail closed with a correction report instead of corrupting the file.
use thiserror::Error;
use xxhash_rust::xxh32::xxh32;

/// Lines of surrounding context shown per mismatched anchor in a report.
const MISMATCH_CONTEXT: usize = 2;

// ── Hashing & display form ────────────────────────────────────────────────────

/// Two-hex-char digest of a line. All whitespace is removed before hashing so
/// indentation changes and CRLF/LF differences don't invalidate anchors; the
/// 8-bit bucket is a staleness detector, not an identifier — collisions are
/// tolerated because the model re-reads on mismatch.
pub fn line_hash(line: &str) -> String {
    let stripped: String = line
        .trim_end_matches('\r')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    format!("{:02x}", xxh32(stripped.as_bytes(), 0) % 256)
}

/// One display line: `LINE:HH|content` plus trailing newline.
pub fn format_line(line_no: usize, content: &str) -> String {
    format!("{line_no}:{}|{content}\n", line_hash(content))
}

// ── Anchors ───────────────────────────────────────────────────────────────────

/// A `(line, hash)` reference into a specific file-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// 1-based line number.
    pub line: usize,
    /// Lowercase hex digest, 1-4 chars as written by the model.
    pub hash: String,
}

/// Parse `LINE:HH` or the tolerant form `LINE:HH|anything`.
pub fn parse_anchor(raw: &str) -> Result<Anchor, HashlineError> {
    let s = raw.trim();
    let s = s.split('|').next().unwrap_or(s).trim();
    let Some((line_part, hash_part)) = s.split_once(':') else {
        return Err(HashlineError::MalformedAnchor(format!(
            "'{raw}' — expected LINE:HASH (e.g. \"42:a3\")"
        )));
    };
    let line: usize = line_part.trim().parse().map_err(|_| {
        HashlineError::MalformedAnchor(format!("'{raw}' — line number '{line_part}' is not an integer"))
    })?;
    if line == 0 {
        return Err(HashlineError::MalformedAnchor(format!(
            "'{raw}' — line numbers are 1-based"
        )));
    }
    let hash = hash_part.trim().to_ascii_lowercase();
    if hash.is_empty() || hash.len() > 4 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HashlineError::MalformedAnchor(format!(
            "'{raw}' — hash must be 1-4 hex chars"
        )));
    }
    Ok(Anchor { line, hash })
}

// ── Edit operations ───────────────────────────────────────────────────────────

/// One edit against a pre-edit file snapshot. `new_text` may expand to any
/// number of lines; empty `new_text` deletes.
#[derive(Debug, Clone)]
pub enum EditOp {
    SetLine { anchor: Anchor, new_text: String },
    ReplaceLines { start_anchor: Anchor, end_anchor: Anchor, new_text: String },
    InsertAfter { anchor: Anchor, text: String },
}

impl EditOp {
    /// The last snapshot line this edit touches — the bottom-up sort key.
    fn end_line(&self) -> usize {
        match self {
            EditOp::SetLine { anchor, .. } => anchor.line,
            EditOp::ReplaceLines { end_anchor, .. } => end_anchor.line,
            EditOp::InsertAfter { anchor, .. } => anchor.line,
        }
    }

    fn anchors(&self) -> Vec<&Anchor> {
        match self {
            EditOp::SetLine { anchor, .. } => vec![anchor],
            EditOp::ReplaceLines { start_anchor, end_anchor, .. } => {
                vec![start_anchor, end_anchor]
            }
            EditOp::InsertAfter { anchor, .. } => vec![anchor],
        }
    }
}

#[derive(Debug, Error)]
pub enum HashlineError {
    #[error("malformed anchor: {0}")]
    MalformedAnchor(String),

    #[error("inverted range: start line {start} is after end line {end}")]
    RangeInverted { start: usize, end: usize },

    #[error("insert_after requires non-empty text")]
    EmptyInsert,

    #[error("{report}")]
    HashMismatch { report: String },

    #[error("edits produced no change — re-read the file to get current anchors")]
    NoOp,
}

// ── Validation ────────────────────────────────────────────────────────────────

enum AnchorFailure {
    /// Line exists but its content hash no longer matches.
    Stale { line: usize },
    /// Line number is beyond the end of the file.
    OutOfRange { line: usize },
}

/// Check one anchor against the snapshot. Comparison is case-insensitive and
/// the anchor hash must match the full two-char digest.
fn check_anchor(anchor: &Anchor, lines: &[&str]) -> Option<AnchorFailure> {
    if anchor.line > lines.len() {
        return Some(AnchorFailure::OutOfRange { line: anchor.line });
    }
    let actual = line_hash(lines[anchor.line - 1]);
    if actual != anchor.hash {
        return Some(AnchorFailure::Stale { line: anchor.line });
    }
    None
}

/// Build the human-readable mismatch block: every failed line with
/// MISMATCH_CONTEXT neighbors on each side, `>>>` on changed lines, `...`
/// between non-adjacent ranges. This is what the model sees as the tool
/// error; it is expected to copy the corrected anchors out of it.
fn mismatch_report(failures: &[AnchorFailure], lines: &[&str]) -> String {
    let mut out = String::from(
        "anchor mismatch — the file changed since it was read. Current content:\n",
    );

    let mut stale: Vec<usize> = failures
        .iter()
        .filter_map(|f| match f {
            AnchorFailure::Stale { line } => Some(*line),
            AnchorFailure::OutOfRange { .. } => None,
        })
        .collect();
    stale.sort_unstable();
    stale.dedup();

    // Merge the per-failure context windows into non-overlapping ranges.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &line in &stale {
        let lo = line.saturating_sub(MISMATCH_CONTEXT).max(1);
        let hi = (line + MISMATCH_CONTEXT).min(lines.len());
        match ranges.last_mut() {
            Some((_, prev_hi)) if lo <= *prev_hi + 1 => *prev_hi = (*prev_hi).max(hi),
            _ => ranges.push((lo, hi)),
        }
    }

    for (i, (lo, hi)) in ranges.iter().enumerate() {
        if i > 0 {
            out.push_str("...\n");
        }
        for line_no in *lo..=*hi {
            let marker = if stale.binary_search(&line_no).is_ok() { ">>> " } else { "    " };
            out.push_str(marker);
            out.push_str(&format_line(line_no, lines[line_no - 1]));
        }
    }

    for f in failures {
        if let AnchorFailure::OutOfRange { line } = f {
            out.push_str(&format!(
                ">>> line {line} is beyond the end of the file ({} lines)\n",
                lines.len()
            ));
        }
    }

    out.push_str("Copy the corrected LINE:HASH anchors from above and retry.");
    out
}

// ── Echo stripping ────────────────────────────────────────────────────────────

/// Does this line start with a plausible display prefix (`N:HH|`)?
/// Returns the byte offset just past the `|` if so.
fn display_prefix_len(line: &str) -> Option<usize> {
    let trimmed_start = line.len() - line.trim_start().len();
    let rest = &line[trimmed_start..];
    let colon = rest.find(':')?;
    let bar = rest.find('|')?;
    if colon == 0 || bar <= colon + 1 {
        return None;
    }
    let line_part = &rest[..colon];
    let hash_part = &rest[colon + 1..bar];
    if !line_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if hash_part.is_empty() || hash_part.len() > 4 || !hash_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed_start + bar + 1)
}

/// Models sometimes echo the display format back in replacement text. If at
/// least half of the non-empty lines carry a valid `N:HH|` prefix, strip the
/// prefix from every line that has one.
pub fn strip_display_prefixes(text: &str) -> String {
    let non_empty: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.is_empty() {
        return text.to_string();
    }
    let prefixed = non_empty.iter().filter(|l| display_prefix_len(l).is_some()).count();
    if prefixed * 2 < non_empty.len() {
        return text.to_string();
    }
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        match display_prefix_len(line) {
            Some(off) => out.push(line[off..].to_string()),
            None => out.push(line.to_string()),
        }
    }
    let mut joined = out.join("\n");
    if text.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

// ── Batch application ─────────────────────────────────────────────────────────

/// Apply a batch of edits whose anchors all refer to `content` as it is now.
///
/// Validation is all-or-nothing: if any anchor fails, a single report covering
/// every failure is returned and the content is untouched. Edits are then
/// spliced bottom-up (sorted by end line descending) so each edit's snapshot
/// coordinates stay valid; at the same line, an insert is applied before a
/// replacement so it lands after the replacement block in the final layout.
pub fn apply_edits(content: &str, edits: &[EditOp]) -> Result<String, HashlineError> {
    // Structural checks surface verbatim, before any hash validation.
    for edit in edits {
        match edit {
            EditOp::ReplaceLines { start_anchor, end_anchor, .. }
                if start_anchor.line > end_anchor.line =>
            {
                return Err(HashlineError::RangeInverted {
                    start: start_anchor.line,
                    end: end_anchor.line,
                });
            }
            EditOp::InsertAfter { text, .. } if text.is_empty() => {
                return Err(HashlineError::EmptyInsert);
            }
            _ => {}
        }
    }

    let snapshot: Vec<&str> = content.lines().collect();

    let failures: Vec<AnchorFailure> = edits
        .iter()
        .flat_map(|e| e.anchors())
        .filter_map(|a| check_anchor(a, &snapshot))
        .collect();
    if !failures.is_empty() {
        return Err(HashlineError::HashMismatch {
            report: mismatch_report(&failures, &snapshot),
        });
    }

    // Bottom-up order; inserts sort ahead of replacements at the same line
    // (an insert targets the gap *after* the line, so it is the deeper edit).
    let mut ordered: Vec<&EditOp> = edits.iter().collect();
    ordered.sort_by(|a, b| {
        b.end_line()
            .cmp(&a.end_line())
            .then_with(|| rank(b).cmp(&rank(a)))
    });

    let mut lines: Vec<String> = snapshot.iter().map(|s| s.to_string()).collect();
    for edit in ordered {
        match edit {
            EditOp::SetLine { anchor, new_text } => {
                let repl = text_lines(new_text);
                lines.splice(anchor.line - 1..anchor.line, repl);
            }
            EditOp::ReplaceLines { start_anchor, end_anchor, new_text } => {
                let repl = text_lines(new_text);
                lines.splice(start_anchor.line - 1..end_anchor.line, repl);
            }
            EditOp::InsertAfter { anchor, text } => {
                let insert = text_lines(text);
                lines.splice(anchor.line..anchor.line, insert);
            }
        }
    }

    let mut result = lines.join("\n");
    if content.ends_with('\n') && !result.is_empty() {
        result.push('\n');
    }
    if result == content {
        return Err(HashlineError::NoOp);
    }
    Ok(result)
}

/// Inserts apply before replacements at the same end line.
fn rank(edit: &EditOp) -> u8 {
    match edit {
        EditOp::InsertAfter { .. } => 1,
        _ => 0,
    }
}

/// Split replacement text into lines, stripping echoed display prefixes.
/// Empty text means delete (no lines).
fn text_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    strip_display_prefixes(text)
        .lines()
        .map(|l| l.to_string())
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
