mod agent;
mod client;
mod commands;
mod config;
mod diff;
mod hashline;
mod logger;
mod process;
mod prompt;
mod tools;
mod tui;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

use crate::agent::Agent;
use crate::commands::Outcome;
use crate::config::{Provider, ResolvedConfig};
use crate::logger::SessionLogger;
use crate::process::ProcessManager;
use crate::tools::ToolContext;
use crate::tui::{PlainUi, Tui, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "nav",
    about = "A terminal coding agent built on hashline-anchored editing",
    version,
)]
struct Args {
    /// One-shot prompt (omit to start the interactive session)
    task: Option<String>,

    /// Model name
    #[arg(short, long, env = "NAV_MODEL")]
    model: Option<String>,

    /// Provider: openai, anthropic or ollama (default: detected from model)
    #[arg(short, long, env = "NAV_PROVIDER")]
    provider: Option<Provider>,

    /// Override the provider base URL
    #[arg(short, long, env = "NAV_BASE_URL")]
    base_url: Option<String>,

    /// Show per-step token usage
    #[arg(short, long)]
    verbose: bool,

    /// Run shell commands inside the OS sandbox
    #[arg(short, long)]
    sandbox: bool,

    /// Enable automatic handover when context usage crosses the threshold
    #[arg(long)]
    enable_handover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let api_key = std::env::var("NAV_API_KEY").ok();

    let mut cfg = ResolvedConfig::resolve(
        args.model.as_deref(),
        args.provider,
        args.base_url.as_deref(),
        api_key.as_deref(),
        args.verbose,
        args.sandbox,
        args.enable_handover,
    );

    if cfg.sandbox {
        check_sandbox_available()?;
    }

    let cwd = std::env::current_dir()?;
    let processes = ProcessManager::new();
    install_signal_handlers(processes.clone());

    let logger = SessionLogger::open(&cwd);
    logger.config(serde_json::json!({
        "model": cfg.model,
        "provider": cfg.provider.to_string(),
        "base_url": cfg.base_url,
        "context_window": cfg.context_window,
        "handover_threshold": cfg.handover_threshold,
        "sandbox": cfg.sandbox,
    }));

    let system_prompt = prompt::build(&cwd);
    logger.system_prompt(&system_prompt);

    let client = cfg.client()?;
    let ctx = ToolContext { cwd: cwd.clone(), processes: processes.clone() };

    // ── One-shot mode ─────────────────────────────────────────────────────────
    if let Some(task) = args.task {
        let ui: Arc<dyn Ui> = Arc::new(PlainUi::new());
        ui.banner(&format!("nav  {} · {}", cfg.provider, cfg.model));
        let mut agent = Agent::new(
            client,
            system_prompt,
            ui.clone(),
            ctx,
            logger,
            cfg.verbose,
            cfg.enable_handover,
            cfg.context_window,
            cfg.handover_threshold,
        );
        let result = agent.run(&task).await;
        processes.kill_all();
        if let Err(e) = result {
            ui.error(&format!("{e:#}"));
            std::process::exit(1);
        }
        return Ok(());
    }

    // ── Interactive mode ──────────────────────────────────────────────────────
    let tui = Tui::new()?;
    install_panic_hook();

    let ui: Arc<dyn Ui> = tui.clone();
    ui.banner(&format!("nav  {} · {}  (Esc cancels, exit quits, /help)", cfg.provider, cfg.model));

    let mut agent = Agent::new(
        client,
        system_prompt,
        ui.clone(),
        ctx,
        logger,
        cfg.verbose,
        cfg.enable_handover,
        cfg.context_window,
        cfg.handover_threshold,
    );

    let mut conventions_seen = prompt::conventions_fingerprint(&cwd);

    while let Some(line) = tui.prompt().await {
        // Rebuilding the prompt breaks the provider KV cache, so it only
        // happens when the conventions files actually changed on disk.
        let conventions_now = prompt::conventions_fingerprint(&cwd);
        if conventions_now != conventions_seen {
            conventions_seen = conventions_now;
            agent.set_system_prompt(prompt::build(&cwd));
            ui.info("project conventions changed — system prompt rebuilt");
        }

        let outcome = if line.starts_with('/') {
            match commands::dispatch(&line, &mut agent, &mut cfg, &ui, &cwd).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    ui.error(&format!("{e:#}"));
                    continue;
                }
            }
        } else {
            Outcome::NotCommand
        };

        let prompt_text = match outcome {
            Outcome::Handled => continue,
            Outcome::Prompt(expanded) => expanded,
            Outcome::NotCommand => line,
        };

        if let Err(e) = agent.run(&prompt_text).await {
            ui.error(&format!("{e:#}"));
        }
    }

    processes.kill_all();
    tui.shutdown();
    Ok(())
}

/// The sandbox wrapper re-execs through the platform sandbox; requesting it
/// where no wrapper exists is one of the few fatal configurations.
fn check_sandbox_available() -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        if std::path::Path::new("/usr/bin/sandbox-exec").exists() {
            return Ok(());
        }
        bail!("sandbox requested but /usr/bin/sandbox-exec is missing");
    }
    #[cfg(not(target_os = "macos"))]
    {
        bail!("sandbox mode is only available on macOS");
    }
}

/// SIGINT/SIGTERM terminate every tracked shell process, restore the
/// terminal, and exit with the conventional codes (130/143).
fn install_signal_handlers(processes: Arc<ProcessManager>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let pm = processes.clone();
        tokio::spawn(async move {
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else { return };
            sigint.recv().await;
            pm.kill_all();
            let _ = crossterm::terminal::disable_raw_mode();
            std::process::exit(130);
        });

        tokio::spawn(async move {
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
            sigterm.recv().await;
            processes.kill_all();
            let _ = crossterm::terminal::disable_raw_mode();
            std::process::exit(143);
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                processes.kill_all();
                let _ = crossterm::terminal::disable_raw_mode();
                std::process::exit(130);
            }
        });
    }
}

/// Leave the terminal usable when something panics mid-session.
fn install_panic_hook() {
    let original = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = crossterm::terminal::disable_raw_mode();
        original(info);
    }));
}
