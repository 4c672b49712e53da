//! Inline terminal UI.
//!
//! Two modes share one raw-mode key stream. *Prompting*: a `> ` marker and a
//! line editor whose result resolves the pending `prompt()` call. *Running*:
//! typed lines are queued for the agent to drain between steps (shown as
//! `queued:` hints) and Escape fires the current run's cancel signal exactly
//! once. Streamed assistant text is indented and soft-wrapped; tool-call
//! rendering always closes the stream line first.
//!
//! A single spawned task owns the crossterm `EventStream`; everything else
//! communicates through the shared state below, so there is exactly one
//! producer and one consumer for the input queue.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyModifiers};
use crossterm::style::Stylize;
use crossterm::terminal::{self, Clear, ClearType};
use crossterm::{cursor, execute};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::client::{cancel_pair, CancelToken};

/// The surface the agent renders into. `Tui` is the interactive
/// implementation; `PlainUi` backs one-shot runs on plain stdout.
#[async_trait::async_trait]
pub trait Ui: Send + Sync {
    fn stream_text(&self, delta: &str);
    fn end_stream(&self);
    fn tool_call(&self, name: &str, summary: &str);
    fn tool_result(&self, summary: &str);
    fn diff(&self, diff: &str);
    fn info(&self, msg: &str);
    fn error(&self, msg: &str);
    fn success(&self, msg: &str);
    fn banner(&self, msg: &str);
    fn thinking(&self, on: bool);
    fn set_running(&self, running: bool);
    fn drain_input(&self) -> Vec<String>;
    fn begin_run(&self) -> CancelToken;
    fn is_cancelled(&self) -> bool;
    /// Arrow-key menu over `items`. Resolves to the chosen index, or `None`
    /// on Escape — and always `None` on non-interactive surfaces.
    async fn select(&self, title: &str, items: &[String]) -> Option<usize>;
}

// ── Inline menu ───────────────────────────────────────────────────────────────

/// An open arrow-key menu. The key task navigates it; the `select` caller
/// waits on `done` for the outcome.
struct MenuState {
    items: Vec<String>,
    selected: usize,
    /// Lines the menu occupies on screen (title + items), for erasing.
    rows: u16,
    done: Option<oneshot::Sender<Option<usize>>>,
}

impl MenuState {
    fn move_up(&mut self) {
        self.selected = if self.selected == 0 { self.items.len() - 1 } else { self.selected - 1 };
    }

    fn move_down(&mut self) {
        self.selected = (self.selected + 1) % self.items.len();
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Shared {
    running: bool,
    buffer: String,
    queue: VecDeque<String>,
    cancel: Option<crate::client::CancelHandle>,
    cancel_fired: bool,
    streaming: bool,
    col: usize,
    spinner_on: bool,
    menu: Option<MenuState>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: false,
            buffer: String::new(),
            queue: VecDeque::new(),
            cancel: None,
            cancel_fired: false,
            streaming: false,
            col: 0,
            spinner_on: false,
            menu: None,
        }
    }

    /// Fire the run's cancel signal. Idempotent within a run.
    fn fire_cancel(&mut self) -> bool {
        if self.cancel_fired {
            return false;
        }
        if let Some(handle) = &self.cancel {
            handle.cancel();
            self.cancel_fired = true;
            return true;
        }
        false
    }
}

// ── Interactive TUI ───────────────────────────────────────────────────────────

enum PromptEvent {
    Line(String),
    Eof,
}

pub struct Tui {
    shared: Arc<Mutex<Shared>>,
    prompt_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PromptEvent>>,
}

impl Tui {
    /// Enable raw mode and start the key task. Raw mode is restored by
    /// `shutdown` (and by the panic hook installed in main).
    pub fn new() -> anyhow::Result<Arc<Self>> {
        terminal::enable_raw_mode()?;
        let shared = Arc::new(Mutex::new(Shared::new()));
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();

        let tui = Arc::new(Self {
            shared: shared.clone(),
            prompt_rx: tokio::sync::Mutex::new(prompt_rx),
        });

        let task_tui = tui.clone();
        tokio::spawn(async move {
            let mut events = EventStream::new();
            while let Some(Ok(event)) = events.next().await {
                if let Event::Key(key) = event {
                    if !task_tui.handle_key(key, &prompt_tx) {
                        let _ = prompt_tx.send(PromptEvent::Eof);
                    }
                }
            }
        });

        Ok(tui)
    }

    pub fn shutdown(&self) {
        let _ = terminal::disable_raw_mode();
    }

    /// Returns false to signal EOF.
    fn handle_key(&self, key: KeyEvent, prompt_tx: &mpsc::UnboundedSender<PromptEvent>) -> bool {
        let mut st = self.shared.lock().unwrap();

        // An open menu owns the key stream until it resolves.
        if st.menu.is_some() {
            match (key.modifiers, key.code) {
                (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                    let menu = st.menu.as_mut().unwrap();
                    menu.move_up();
                    let (items, selected) = (menu.items.clone(), menu.selected);
                    drop(st);
                    self.draw_menu_items(&items, selected, true);
                }
                (_, KeyCode::Down) | (_, KeyCode::Char('j')) | (_, KeyCode::Tab) => {
                    let menu = st.menu.as_mut().unwrap();
                    menu.move_down();
                    let (items, selected) = (menu.items.clone(), menu.selected);
                    drop(st);
                    self.draw_menu_items(&items, selected, true);
                }
                (_, KeyCode::Enter) => {
                    let mut menu = st.menu.take().unwrap();
                    drop(st);
                    self.erase_menu(menu.rows);
                    if let Some(done) = menu.done.take() {
                        let _ = done.send(Some(menu.selected));
                    }
                }
                (_, KeyCode::Esc) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                    let mut menu = st.menu.take().unwrap();
                    drop(st);
                    self.erase_menu(menu.rows);
                    if let Some(done) = menu.done.take() {
                        let _ = done.send(None);
                    }
                }
                _ => {}
            }
            return true;
        }

        match (key.modifiers, key.code) {
            (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                if st.running {
                    if st.fire_cancel() {
                        drop(st);
                        self.print_raw(&format!("\n{}\n", "■ stopped".red()));
                    }
                    return true;
                }
                return false;
            }
            (KeyModifiers::CONTROL, KeyCode::Char('d')) => {
                return !st.buffer.is_empty();
            }
            (KeyModifiers::CONTROL, KeyCode::Char('u')) => {
                let n = st.buffer.chars().count();
                st.buffer.clear();
                drop(st);
                self.print_raw(&"\x08 \x08".repeat(n));
            }
            (_, KeyCode::Esc) => {
                if st.running && st.fire_cancel() {
                    drop(st);
                    self.print_raw(&format!("\n{}\n", "■ stopped".red()));
                }
            }
            (_, KeyCode::Enter) => {
                let line = std::mem::take(&mut st.buffer);
                if st.running {
                    let show = !line.trim().is_empty();
                    if show {
                        st.queue.push_back(line.clone());
                    }
                    drop(st);
                    self.print_raw("\n");
                    if show {
                        self.print_raw(&format!("{} {}\n", "queued:".dark_yellow(), line));
                    }
                } else {
                    drop(st);
                    self.print_raw("\n");
                    let _ = prompt_tx.send(PromptEvent::Line(line));
                }
            }
            (_, KeyCode::Backspace) => {
                if st.buffer.pop().is_some() {
                    drop(st);
                    self.print_raw("\x08 \x08");
                }
            }
            (m, KeyCode::Char(c)) if m.is_empty() || m == KeyModifiers::SHIFT => {
                st.buffer.push(c);
                drop(st);
                let mut buf = [0u8; 4];
                self.print_raw(c.encode_utf8(&mut buf));
            }
            _ => {}
        }
        true
    }

    /// Raw-mode-safe write: LF becomes CRLF.
    fn print_raw(&self, s: &str) {
        let mut out = std::io::stdout();
        let _ = write!(out, "{}", s.replace('\n', "\r\n"));
        let _ = out.flush();
    }

    /// Read one line at the prompt. `None` means EOF — Ctrl+D, Ctrl+C, or an
    /// exit word.
    pub async fn prompt(&self) -> Option<String> {
        self.print_raw(&format!("{} ", ">".cyan().bold()));
        let mut rx = self.prompt_rx.lock().await;
        loop {
            match rx.recv().await? {
                PromptEvent::Eof => {
                    self.print_raw("\n");
                    return None;
                }
                PromptEvent::Line(line) => {
                    let line = line.trim().to_string();
                    if matches!(line.as_str(), "exit" | "quit" | "q") {
                        return None;
                    }
                    if line.is_empty() {
                        self.print_raw(&format!("{} ", ">".cyan().bold()));
                        continue;
                    }
                    return Some(line);
                }
            }
        }
    }

    /// Paint the menu items, highlighting the selection. On a redraw the
    /// cursor sits just below the menu, so step back up over it first.
    fn draw_menu_items(&self, items: &[String], selected: usize, redraw: bool) {
        let mut out = std::io::stdout();
        if redraw {
            let _ = execute!(out, cursor::MoveUp(items.len() as u16));
        }
        for (i, item) in items.iter().enumerate() {
            let _ = execute!(out, cursor::MoveToColumn(0), Clear(ClearType::CurrentLine));
            let line = if i == selected {
                format!("  {} {}", "▸".cyan(), item.as_str().bold())
            } else {
                format!("    {item}")
            };
            let _ = write!(out, "{line}\r\n");
        }
        let _ = out.flush();
    }

    /// Remove a closed menu from the screen (title line included).
    fn erase_menu(&self, rows: u16) {
        let mut out = std::io::stdout();
        let _ = execute!(
            out,
            cursor::MoveToColumn(0),
            cursor::MoveUp(rows),
            Clear(ClearType::FromCursorDown)
        );
        let _ = out.flush();
    }

    fn spinner(&self, on: bool) {
        let start = {
            let mut st = self.shared.lock().unwrap();
            if st.spinner_on == on {
                return;
            }
            st.spinner_on = on;
            on
        };
        if !start {
            self.print_raw("\r        \r");
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            const FRAMES: [&str; 4] = ["◐", "◓", "◑", "◒"];
            let mut i = 0usize;
            loop {
                {
                    let st = shared.lock().unwrap();
                    if !st.spinner_on {
                        break;
                    }
                }
                let frame = format!("\r  {} ", FRAMES[i % FRAMES.len()].cyan());
                let mut out = std::io::stdout();
                let _ = write!(out, "{frame}");
                let _ = out.flush();
                i += 1;
                tokio::time::sleep(std::time::Duration::from_millis(120)).await;
            }
        });
    }
}

#[async_trait::async_trait]
impl Ui for Tui {
    async fn select(&self, title: &str, items: &[String]) -> Option<usize> {
        if items.is_empty() {
            return None;
        }
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut st = self.shared.lock().unwrap();
            if st.menu.is_some() {
                return None; // one menu at a time
            }
            st.menu = Some(MenuState {
                items: items.to_vec(),
                selected: 0,
                rows: items.len() as u16 + 1,
                done: Some(done_tx),
            });
        }
        self.print_raw(&format!(
            "  {}  {}\n",
            title.bold(),
            "↑↓ select · Enter confirm · Esc cancel".dark_grey()
        ));
        self.draw_menu_items(items, 0, false);
        done_rx.await.unwrap_or(None)
    }

    fn stream_text(&self, delta: &str) {
        self.thinking(false);
        let width = terminal::size().map(|(w, _)| w as usize).unwrap_or(100).max(20);
        let mut rendered = String::new();
        {
            let mut st = self.shared.lock().unwrap();
            if !st.streaming {
                st.streaming = true;
                rendered.push_str("\n  ");
                st.col = 2;
            }
            for ch in delta.chars() {
                if ch == '\n' {
                    rendered.push_str("\n  ");
                    st.col = 2;
                } else {
                    if st.col + 1 >= width {
                        rendered.push_str("\n  ");
                        st.col = 2;
                    }
                    rendered.push(ch);
                    st.col += 1;
                }
            }
        }
        self.print_raw(&rendered);
    }

    fn end_stream(&self) {
        let was_streaming = {
            let mut st = self.shared.lock().unwrap();
            std::mem::replace(&mut st.streaming, false)
        };
        if was_streaming {
            self.print_raw("\n");
        }
    }

    fn tool_call(&self, name: &str, summary: &str) {
        self.end_stream();
        self.thinking(false);
        self.print_raw(&format!("\n  {} {}  {}\n", "▸".magenta(), name.bold(), summary.dark_grey()));
    }

    fn tool_result(&self, summary: &str) {
        let first = summary.lines().next().unwrap_or(summary);
        self.print_raw(&format!("    {} {}\n", "→".dark_grey(), first.dark_grey()));
    }

    fn diff(&self, diff: &str) {
        let mut rendered = String::new();
        for line in diff.lines() {
            let styled = if line.starts_with('+') {
                format!("{}", line.green())
            } else if line.starts_with('-') {
                format!("{}", line.red())
            } else if line.starts_with("@@") {
                format!("{}", line.cyan())
            } else {
                format!("{}", line.dark_grey())
            };
            rendered.push_str(&format!("    {styled}\n"));
        }
        self.print_raw(&rendered);
    }

    fn info(&self, msg: &str) {
        self.end_stream();
        self.print_raw(&format!("  {}\n", msg.dark_grey()));
    }

    fn error(&self, msg: &str) {
        self.end_stream();
        self.thinking(false);
        self.print_raw(&format!("  {} {}\n", "✗".red(), msg.red()));
    }

    fn success(&self, msg: &str) {
        self.end_stream();
        self.print_raw(&format!("  {} {}\n", "✓".green(), msg));
    }

    fn banner(&self, msg: &str) {
        self.end_stream();
        self.print_raw(&format!("\n  {}\n\n", msg.cyan().bold()));
    }

    fn thinking(&self, on: bool) {
        self.spinner(on);
    }

    fn set_running(&self, running: bool) {
        let mut st = self.shared.lock().unwrap();
        st.running = running;
        if !running {
            st.spinner_on = false;
        }
    }

    fn drain_input(&self) -> Vec<String> {
        let mut st = self.shared.lock().unwrap();
        st.queue.drain(..).collect()
    }

    fn begin_run(&self) -> CancelToken {
        let (handle, token) = cancel_pair();
        let mut st = self.shared.lock().unwrap();
        st.cancel = Some(handle);
        st.cancel_fired = false;
        token
    }

    fn is_cancelled(&self) -> bool {
        self.shared.lock().unwrap().cancel_fired
    }
}

// ── Plain stdout surface (one-shot mode) ──────────────────────────────────────

pub struct PlainUi {
    shared: Mutex<Shared>,
}

impl PlainUi {
    pub fn new() -> Self {
        Self { shared: Mutex::new(Shared::new()) }
    }
}

impl Default for PlainUi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Ui for PlainUi {
    async fn select(&self, _title: &str, _items: &[String]) -> Option<usize> {
        None
    }

    fn stream_text(&self, delta: &str) {
        print!("{delta}");
        let _ = std::io::stdout().flush();
    }

    fn end_stream(&self) {
        println!();
    }

    fn tool_call(&self, name: &str, summary: &str) {
        println!("\n  ▸ {name}  {summary}");
    }

    fn tool_result(&self, summary: &str) {
        println!("    → {}", summary.lines().next().unwrap_or(summary));
    }

    fn diff(&self, _diff: &str) {}

    fn info(&self, msg: &str) {
        println!("  {msg}");
    }

    fn error(&self, msg: &str) {
        eprintln!("  ✗ {msg}");
    }

    fn success(&self, msg: &str) {
        println!("  ✓ {msg}");
    }

    fn banner(&self, msg: &str) {
        println!("\n  {msg}\n");
    }

    fn thinking(&self, _on: bool) {}

    fn set_running(&self, running: bool) {
        self.shared.lock().unwrap().running = running;
    }

    fn drain_input(&self) -> Vec<String> {
        Vec::new()
    }

    fn begin_run(&self) -> CancelToken {
        let (handle, token) = cancel_pair();
        let mut st = self.shared.lock().unwrap();
        st.cancel = Some(handle);
        st.cancel_fired = false;
        token
    }

    fn is_cancelled(&self) -> bool {
        self.shared.lock().unwrap().cancel_fired
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_drained_in_submission_order() {
        let mut st = Shared::new();
        st.running = true;
        st.queue.push_back("first".into());
        st.queue.push_back("second".into());
        let drained: Vec<String> = st.queue.drain(..).collect();
        assert_eq!(drained, ["first", "second"]);
        assert!(st.queue.is_empty());
    }

    #[test]
    fn cancel_fires_exactly_once_per_run() {
        let mut st = Shared::new();
        let (handle, token) = cancel_pair();
        st.cancel = Some(handle);

        assert!(st.fire_cancel());
        assert!(!st.fire_cancel()); // second Escape is a no-op
        assert!(token.is_cancelled());

        // A new run resets the latch.
        let (handle2, token2) = cancel_pair();
        st.cancel = Some(handle2);
        st.cancel_fired = false;
        assert!(st.fire_cancel());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn cancel_without_a_run_is_inert() {
        let mut st = Shared::new();
        assert!(!st.fire_cancel());
    }

    #[test]
    fn menu_navigation_wraps_both_ways() {
        let mut menu = MenuState {
            items: vec!["a".into(), "b".into(), "c".into()],
            selected: 0,
            rows: 4,
            done: None,
        };
        menu.move_up();
        assert_eq!(menu.selected, 2); // wraps to the last entry
        menu.move_down();
        assert_eq!(menu.selected, 0);
        menu.move_down();
        menu.move_down();
        menu.move_down();
        assert_eq!(menu.selected, 0); // full cycle
    }

    #[tokio::test]
    async fn menu_resolution_reaches_the_selector() {
        // Drive the oneshot the way the key task does on Enter.
        let (tx, rx) = oneshot::channel();
        let mut menu = MenuState {
            items: vec!["x".into(), "y".into()],
            selected: 0,
            rows: 3,
            done: Some(tx),
        };
        menu.move_down();
        let done = menu.done.take().unwrap();
        done.send(Some(menu.selected)).unwrap();
        assert_eq!(rx.await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn plain_ui_select_declines() {
        let ui = PlainUi::new();
        assert_eq!(ui.select("pick", &["a".into()]).await, None);
    }

    #[test]
    fn plain_ui_has_no_input_queue() {
        let ui = PlainUi::new();
        let token = ui.begin_run();
        assert!(ui.drain_input().is_empty());
        assert!(!ui.is_cancelled());
        assert!(!token.is_cancelled());
    }
}
