/// Line-oriented Myers diff with unified rendering.
///
/// Used by the edit tool to show the model (and the user) what an edit did.
/// The shortest-edit-script search is the classic O(ND) greedy algorithm with
/// a per-depth trace for backtracking.

/// One line-level operation in the edit script, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// Line present in both sides: (old index, new index).
    Equal(usize, usize),
    /// Line removed from the old side.
    Delete(usize),
    /// Line added on the new side.
    Insert(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

impl std::fmt::Display for DiffStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{}, -{}", self.added, self.removed)
    }
}

/// Count added/removed lines between two contents.
pub fn stats(old: &str, new: &str) -> DiffStats {
    let ops = myers(&lines(old), &lines(new));
    let mut s = DiffStats::default();
    for op in ops {
        match op {
            Op::Delete(_) => s.removed += 1,
            Op::Insert(_) => s.added += 1,
            Op::Equal(..) => {}
        }
    }
    s
}

/// Render a unified diff with `context` lines around each change. Returns an
/// empty string when the contents are identical.
pub fn unified(old: &str, new: &str, context: usize) -> String {
    let old_lines = lines(old);
    let new_lines = lines(new);
    let ops = myers(&old_lines, &new_lines);

    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(..)))
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return String::new();
    }

    // Group changes whose context windows touch into hunks over op indices.
    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for &i in &changed {
        let lo = i.saturating_sub(context);
        let hi = (i + context + 1).min(ops.len());
        match hunks.last_mut() {
            Some((_, prev_hi)) if lo <= *prev_hi => *prev_hi = (*prev_hi).max(hi),
            _ => hunks.push((lo, hi)),
        }
    }

    let mut out = String::new();
    for (lo, hi) in hunks {
        let slice = &ops[lo..hi];
        let old_start = slice
            .iter()
            .find_map(|op| match op {
                Op::Equal(o, _) | Op::Delete(o) => Some(o + 1),
                Op::Insert(_) => None,
            })
            .unwrap_or(1);
        let new_start = slice
            .iter()
            .find_map(|op| match op {
                Op::Equal(_, n) | Op::Insert(n) => Some(n + 1),
                Op::Delete(_) => None,
            })
            .unwrap_or(1);
        let old_count = slice.iter().filter(|op| !matches!(op, Op::Insert(_))).count();
        let new_count = slice.iter().filter(|op| !matches!(op, Op::Delete(_))).count();

        out.push_str(&format!("@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"));
        for op in slice {
            match op {
                Op::Equal(o, _) => {
                    out.push(' ');
                    out.push_str(old_lines[*o]);
                }
                Op::Delete(o) => {
                    out.push('-');
                    out.push_str(old_lines[*o]);
                }
                Op::Insert(n) => {
                    out.push('+');
                    out.push_str(new_lines[*n]);
                }
            }
            out.push('\n');
        }
    }
    out
}

/// 1-based inclusive line ranges of the new content touched by each change
/// hunk, with `context` lines included. Used to echo fresh anchors after an
/// edit without spanning untouched regions.
pub fn changed_new_ranges(old: &str, new: &str, context: usize) -> Vec<(usize, usize)> {
    let ops = myers(&lines(old), &lines(new));
    let mut ranges: Vec<(usize, usize)> = Vec::new();

    // Track the new-file line each op lands on; deletions anchor to the line
    // that now occupies their position.
    let mut new_line = 0usize;
    for op in &ops {
        let (is_change, at) = match op {
            Op::Equal(..) => {
                new_line += 1;
                (false, new_line)
            }
            Op::Insert(_) => {
                new_line += 1;
                (true, new_line)
            }
            Op::Delete(_) => (true, (new_line + 1).max(1)),
        };
        if !is_change {
            continue;
        }
        let lo = at.saturating_sub(context).max(1);
        let hi = at + context;
        match ranges.last_mut() {
            Some((_, prev_hi)) if lo <= *prev_hi + 1 => *prev_hi = (*prev_hi).max(hi),
            _ => ranges.push((lo, hi)),
        }
    }

    let total = new.lines().count();
    ranges
        .into_iter()
        .map(|(lo, hi)| (lo, hi.min(total)))
        .filter(|(lo, hi)| lo <= hi)
        .collect()
}

fn lines(content: &str) -> Vec<&str> {
    content.lines().collect()
}

// ── Myers shortest edit script ────────────────────────────────────────────────

fn myers(a: &[&str], b: &[&str]) -> Vec<Op> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    if max == 0 {
        return Vec::new();
    }

    let offset = max;
    let width = (2 * max + 1) as usize;
    let mut v = vec![0isize; width];
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut found_d = None;

    'search: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let i = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[i - 1] < v[i + 1]) {
                v[i + 1]
            } else {
                v[i - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[i] = x;
            if x >= n && y >= m {
                found_d = Some(d);
                break 'search;
            }
            k += 2;
        }
    }

    let d_final = found_d.expect("edit distance bounded by n + m");

    // Walk the trace backwards from (n, m) to (0, 0).
    let mut ops: Vec<Op> = Vec::new();
    let mut x = n;
    let mut y = m;
    for d in (0..=d_final).rev() {
        let v = &trace[d as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Op::Equal((x - 1) as usize, (y - 1) as usize));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                ops.push(Op::Insert((y - 1) as usize));
            } else {
                ops.push(Op::Delete((x - 1) as usize));
            }
        }
        x = prev_x;
        y = prev_y;
    }
    ops.reverse();
    ops
}

// ── Tests ─────────────────────────────────────────────────────────────────────
