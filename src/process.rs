/// Shell execution with a foreground wait budget and background tracking.
///
/// Every command runs under `sh -c` with both streams piped into a bounded
/// per-process buffer. Completion is raced against `wait_ms`; a command that
/// outlives its budget is not killed — it is registered in a pid-keyed map,
/// its output keeps accumulating, and its exit code is latched when it
/// eventually finishes. The `shell_status` tool reads these entries back.
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Cap on captured bytes per process; excess is dropped, not rotated.
pub const MAX_OUTPUT: usize = 256 * 1024;
/// Tail size shown in `status` views.
const STATUS_TAIL: usize = 2 * 1024;
/// Command text is truncated to this many chars in listings.
const COMMAND_DISPLAY: usize = 60;

// ── Bounded output buffer ─────────────────────────────────────────────────────

#[derive(Default)]
struct OutputBuffer {
    bytes: Vec<u8>,
    dropped: bool,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.dropped = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Last `n` bytes, `...` prefixed when the front was cut off.
    fn tail(&self, n: usize) -> String {
        if self.bytes.len() <= n {
            return self.text();
        }
        let mut start = self.bytes.len() - n;
        // Step forward to a UTF-8 boundary so the lossy decode stays clean.
        while start < self.bytes.len() && (self.bytes[start] & 0xc0) == 0x80 {
            start += 1;
        }
        format!("...\n{}", String::from_utf8_lossy(&self.bytes[start..]))
    }
}

// ── Outcome of a foreground run ───────────────────────────────────────────────

#[derive(Debug)]
pub struct ShellOutcome {
    pub completed: bool,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub output: String,
    pub truncated: bool,
}

// ── Tracked background process ────────────────────────────────────────────────

struct Tracked {
    command: String,
    started_at: Instant,
    exit_code: Arc<Mutex<Option<i32>>>,
    buffer: Arc<Mutex<OutputBuffer>>,
}

/// A point-in-time view of one tracked process.
#[derive(Debug, Clone)]
pub struct ProcessView {
    pub pid: u32,
    pub command: String,
    pub exit_code: Option<i32>,
    pub elapsed_secs: u64,
    pub output: String,
    pub truncated: bool,
}

impl ProcessView {
    pub fn running(&self) -> bool {
        self.exit_code.is_none()
    }

    pub fn short_command(&self) -> String {
        truncate_chars(&self.command, COMMAND_DISPLAY)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct ProcessManager {
    procs: Mutex<HashMap<u32, Tracked>>,
}

impl ProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { procs: Mutex::new(HashMap::new()) })
    }

    /// Run `command` under `sh -c`, waiting up to `wait_ms` for completion.
    /// `wait_ms == 0` backgrounds immediately.
    pub async fn run(self: &Arc<Self>, command: &str, wait_ms: u64) -> Result<ShellOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("TERM", "dumb")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn: {command}"))?;

        let pid = child.id().unwrap_or(0);
        let buffer = Arc::new(Mutex::new(OutputBuffer::default()));

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;
        let out_reader = spawn_reader(stdout, buffer.clone());
        let err_reader = spawn_reader(stderr, buffer.clone());

        if wait_ms > 0 {
            tokio::select! {
                status = child.wait() => {
                    // Drain whatever the readers haven't consumed yet.
                    let _ = out_reader.await;
                    let _ = err_reader.await;
                    let exit_code = status.ok().and_then(|s| s.code());
                    let (mut output, truncated) = {
                        let buf = buffer.lock().unwrap();
                        (buf.text(), buf.dropped)
                    };
                    if let Some(code) = exit_code {
                        if code != 0 {
                            if !output.is_empty() && !output.ends_with('\n') {
                                output.push('\n');
                            }
                            output.push_str(&format!("exit code: {code}\n"));
                        }
                    }
                    return Ok(ShellOutcome { completed: true, pid, exit_code, output, truncated });
                }
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            }
        }

        // Budget exhausted (or zero): track and keep reading in the background.
        let exit_code = Arc::new(Mutex::new(None));
        self.procs.lock().unwrap().insert(
            pid,
            Tracked {
                command: command.to_string(),
                started_at: Instant::now(),
                exit_code: exit_code.clone(),
                buffer: buffer.clone(),
            },
        );

        let latch = exit_code.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = out_reader.await;
            let _ = err_reader.await;
            let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            *latch.lock().unwrap() = Some(code);
        });

        let (output, truncated) = {
            let buf = buffer.lock().unwrap();
            (buf.text(), buf.dropped)
        };
        Ok(ShellOutcome { completed: false, pid, exit_code: None, output, truncated })
    }

    /// Snapshot one tracked process, with the full captured output.
    pub fn view(&self, pid: u32) -> Option<ProcessView> {
        let procs = self.procs.lock().unwrap();
        let t = procs.get(&pid)?;
        let buf = t.buffer.lock().unwrap();
        let view = ProcessView {
            pid,
            command: t.command.clone(),
            exit_code: *t.exit_code.lock().unwrap(),
            elapsed_secs: t.started_at.elapsed().as_secs(),
            output: buf.text(),
            truncated: buf.dropped,
        };
        Some(view)
    }

    /// Snapshot every tracked process, newest first.
    pub fn list(&self) -> Vec<ProcessView> {
        let procs = self.procs.lock().unwrap();
        let mut views: Vec<(Instant, ProcessView)> = procs
            .iter()
            .map(|(pid, t)| {
                let buf = t.buffer.lock().unwrap();
                (
                    t.started_at,
                    ProcessView {
                        pid: *pid,
                        command: t.command.clone(),
                        exit_code: *t.exit_code.lock().unwrap(),
                        elapsed_secs: t.started_at.elapsed().as_secs(),
                        output: buf.tail(STATUS_TAIL),
                        truncated: buf.dropped,
                    },
                )
            })
            .collect();
        views.sort_by(|a, b| b.0.cmp(&a.0));
        views.into_iter().map(|(_, v)| v).collect()
    }

    /// A ≤2 KiB tail of the buffer, for status lines.
    pub fn status_tail(&self, pid: u32) -> Option<String> {
        let procs = self.procs.lock().unwrap();
        let t = procs.get(&pid)?;
        let tail = t.buffer.lock().unwrap().tail(STATUS_TAIL);
        Some(tail)
    }

    /// Last `n` bytes of the buffer.
    pub fn tail(&self, pid: u32, n: usize) -> Option<String> {
        let procs = self.procs.lock().unwrap();
        let t = procs.get(&pid)?;
        let tail = t.buffer.lock().unwrap().tail(n);
        Some(tail)
    }

    /// Send SIGTERM to a tracked, still-running process. Returns false when
    /// the pid is unknown; a process that already exited counts as success.
    pub fn kill(&self, pid: u32) -> bool {
        let procs = self.procs.lock().unwrap();
        let Some(t) = procs.get(&pid) else { return false };
        if t.exit_code.lock().unwrap().is_some() {
            return true;
        }
        terminate(pid);
        true
    }

    /// Terminate every tracked running process. Called on clean shutdown;
    /// errors are ignored.
    pub fn kill_all(&self) {
        let procs = self.procs.lock().unwrap();
        for (pid, t) in procs.iter() {
            if t.exit_code.lock().unwrap().is_none() {
                terminate(*pid);
            }
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Read one stream to EOF into the shared buffer.
fn spawn_reader(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buffer: Arc<Mutex<OutputBuffer>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().unwrap().push(&chunk[..n]),
            }
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_command_completes_in_foreground() {
        let pm = ProcessManager::new();
        let out = pm.run("sleep 0.05 && echo done", 500).await.unwrap();
        assert!(out.completed);
        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.contains("done"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_appended_to_output() {
        let pm = ProcessManager::new();
        let out = pm.run("echo oops >&2; exit 3", 2000).await.unwrap();
        assert!(out.completed);
        assert_eq!(out.exit_code, Some(3));
        assert!(out.output.contains("oops"));
        assert!(out.output.contains("exit code: 3"));
    }

    #[tokio::test]
    async fn slow_command_is_backgrounded_and_latches_exit() {
        let pm = ProcessManager::new();
        let out = pm.run("sleep 0.2 && echo late", 10).await.unwrap();
        assert!(!out.completed);
        assert!(out.pid > 0);
        assert!(pm.view(out.pid).unwrap().running());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let view = pm.view(out.pid).unwrap();
        assert_eq!(view.exit_code, Some(0));
        assert!(view.output.contains("late"));
    }

    #[tokio::test]
    async fn wait_ms_zero_backgrounds_immediately() {
        let pm = ProcessManager::new();
        let out = pm.run("echo now", 0).await.unwrap();
        assert!(!out.completed);
        assert!(pm.view(out.pid).is_some());
    }

    #[tokio::test]
    async fn output_is_bounded_and_marked_truncated() {
        let pm = ProcessManager::new();
        // ~1 MiB of output, well past the 256 KiB cap.
        let out = pm
            .run("yes 0123456789abcdef0123456789abcdef | head -c 1048576", 5000)
            .await
            .unwrap();
        assert!(out.completed);
        assert!(out.truncated);
        assert!(out.output.len() <= MAX_OUTPUT + 32);
    }

    #[tokio::test]
    async fn tail_respects_the_requested_size() {
        let pm = ProcessManager::new();
        let out = pm.run("seq 1 5000; sleep 0.3", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let tail = pm.tail(out.pid, 100).unwrap();
        assert!(tail.len() <= 100 + "...\n".len());
        assert!(tail.starts_with("..."));
    }

    #[tokio::test]
    async fn kill_terminates_a_tracked_process() {
        let pm = ProcessManager::new();
        let out = pm.run("sleep 30", 10).await.unwrap();
        assert!(pm.kill(out.pid));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let view = pm.view(out.pid).unwrap();
        assert!(!view.running());
        assert!(!pm.kill(999_999_999));
    }

    #[test]
    fn buffer_drops_excess_bytes() {
        let mut buf = OutputBuffer::default();
        buf.push(&vec![b'x'; MAX_OUTPUT + 100]);
        assert_eq!(buf.bytes.len(), MAX_OUTPUT);
        assert!(buf.dropped);
    }

    #[test]
    fn command_display_is_truncated() {
        let view = ProcessView {
            pid: 1,
            command: "x".repeat(100),
            exit_code: None,
            elapsed_secs: 0,
            output: String::new(),
            truncated: false,
        };
        assert!(view.short_command().chars().count() <= COMMAND_DISPLAY);
    }
}
