//! The agent loop: a step-by-step conversation between the model and the
//! local effectors.
//!
//! One `run` handles one user turn: stream a completion, render text as it
//! arrives, execute any tool calls in issuance order, feed the results back,
//! repeat — until the model answers with plain text or the step limit trips.
//! Queued user input is drained between steps as interjections; crossing the
//! context-usage threshold triggers a handover (mid-turn, or deferred to the
//! next turn when the current one already finished).

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::client::{CancelToken, LlmClient, Message, StreamEvent, ToolCall, ToolSpec, Usage};
use crate::logger::SessionLogger;
use crate::tools::{self, ToolContext};
use crate::tui::Ui;

/// Safety net on tool-use round-trips within a single run.
pub const MAX_STEPS: usize = 50;

const SUMMARY_PROMPT: &str = "Summarize concisely what has been done so far in this session and \
what remains to be done, so a fresh session can pick the work up. Plain text, no tool calls.";

pub struct Agent {
    conversation: Vec<Message>,
    client: Box<dyn LlmClient>,
    system_prompt: String,
    specs: Vec<ToolSpec>,
    ui: Arc<dyn Ui>,
    ctx: ToolContext,
    logger: SessionLogger,
    verbose: bool,
    handover_enabled: bool,
    context_window: Option<u32>,
    handover_threshold: f32,
    last_input_tokens: u32,
    pending_auto_handover: bool,
}

/// How a single pass through the step loop ended.
enum StepLoopEnd {
    Finished,
    HandoverNow,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Box<dyn LlmClient>,
        system_prompt: String,
        ui: Arc<dyn Ui>,
        ctx: ToolContext,
        logger: SessionLogger,
        verbose: bool,
        handover_enabled: bool,
        context_window: Option<u32>,
        handover_threshold: f32,
    ) -> Self {
        Self {
            conversation: Vec::new(),
            client,
            system_prompt,
            specs: tools::definitions(),
            ui,
            ctx,
            logger,
            verbose,
            handover_enabled,
            context_window,
            handover_threshold,
            last_input_tokens: 0,
            pending_auto_handover: false,
        }
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn conversation_len(&self) -> usize {
        self.conversation.len()
    }

    /// Drop the conversation. The system prompt is retained byte-identical.
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.pending_auto_handover = false;
        self.last_input_tokens = 0;
    }

    /// Hot-swap the provider between turns. The conversation is preserved and
    /// replayed to the new provider on the next stream.
    pub fn set_llm(&mut self, client: Box<dyn LlmClient>) {
        self.client = client;
    }

    /// Replace the system prompt. Breaks the provider KV cache, so this is
    /// only called when external prompt inputs changed on disk.
    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = prompt;
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Run one user turn to completion.
    pub async fn run(&mut self, user_prompt: &str) -> Result<()> {
        let mut prompt = user_prompt.to_string();
        loop {
            // A handover flagged at the end of a previous turn is deferred
            // until new user intent arrives — which is now.
            if self.pending_auto_handover && self.context_window.is_some() {
                self.pending_auto_handover = false;
                match self.summarize_and_reset(Some(&prompt)).await? {
                    Some(composed) => {
                        prompt = composed;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            match self.step_loop(&prompt).await? {
                StepLoopEnd::Finished => return Ok(()),
                StepLoopEnd::HandoverNow => match self.summarize_and_reset(None).await? {
                    Some(composed) => prompt = composed,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Voluntary handover (`/handover`): summarize, reset, continue.
    pub async fn handover(&mut self, instructions: Option<&str>) -> Result<()> {
        match self.summarize_and_reset(instructions).await? {
            Some(composed) => self.run(&composed).await,
            None => Ok(()),
        }
    }

    // ── The step loop ─────────────────────────────────────────────────────────

    async fn step_loop(&mut self, prompt: &str) -> Result<StepLoopEnd> {
        self.push(Message::user(prompt));
        self.ui.set_running(true);
        let cancel = self.ui.begin_run();

        let mut end = StepLoopEnd::Finished;
        for _step in 0..MAX_STEPS {
            self.drain_interjections();

            self.ui.thinking(true);
            let outcome = self.stream_step(&cancel).await;
            self.ui.end_stream();
            self.ui.thinking(false);

            let step = match outcome {
                Ok(step) => step,
                Err(e) => {
                    // Network/auth failures surface once and end the turn; the
                    // next user turn may retry with the conversation intact.
                    self.logger.error(&e.to_string());
                    self.ui.error(&e.to_string());
                    break;
                }
            };

            if let Some(usage) = step.usage {
                self.last_input_tokens = usage.input_tokens;
                self.logger.usage(usage);
                if self.verbose {
                    self.ui.info(&format!(
                        "tokens: in {} out {}",
                        usage.input_tokens, usage.output_tokens
                    ));
                }
            }

            // Keep whatever the model produced, including text cut short by a
            // cancel — the user already saw it.
            if !step.text.is_empty() || !step.tool_calls.is_empty() {
                self.push(Message::assistant(step.text.clone(), step.tool_calls.clone()));
            }

            if cancel.is_cancelled() {
                break; // silent: cancellation is not an error
            }

            let over_threshold = self.over_threshold();

            if step.tool_calls.is_empty() {
                if over_threshold {
                    self.pending_auto_handover = true;
                }
                if self.has_queued_input() {
                    continue; // the queued line becomes the next interjection
                }
                break;
            }

            self.execute_tool_calls(&step.tool_calls, &cancel).await;

            if over_threshold {
                end = StepLoopEnd::HandoverNow;
                break;
            }

            self.drain_interjections();
        }

        self.ui.set_running(false);
        Ok(end)
    }

    /// One streamed completion: returns the accumulated text, the tool calls
    /// in issuance order, and the usage report if one arrived.
    async fn stream_step(&mut self, cancel: &CancelToken) -> Result<StepOutput, crate::client::ClientError> {
        let mut rx = self
            .client
            .stream(&self.system_prompt, &self.conversation, &self.specs, cancel.clone())
            .await?;

        let mut out = StepOutput::default();
        while let Some(event) = rx.recv().await {
            match event {
                Ok(StreamEvent::Text(delta)) => {
                    self.ui.stream_text(&delta);
                    out.text.push_str(&delta);
                }
                Ok(StreamEvent::ToolCall(call)) => out.tool_calls.push(call),
                Ok(StreamEvent::Done(usage)) => out.usage = Some(usage),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn execute_tool_calls(&mut self, calls: &[ToolCall], cancel: &CancelToken) {
        for call in calls {
            // A cancel mid-step skips the calls not yet started; anything
            // already running in the process manager is left to finish there.
            if cancel.is_cancelled() {
                break;
            }

            let args: Value = match serde_json::from_str(&call.arguments) {
                Ok(v) => v,
                Err(e) => {
                    self.ui.error(&format!("{}: bad tool arguments: {e}", call.name));
                    Value::Object(Default::default())
                }
            };

            self.logger.tool_call(call);
            self.ui.tool_call(&call.name, &args_summary(&args));

            let result = tools::dispatch(&call.name, &args, &self.ctx).await;
            self.ui.tool_result(&result.display_summary);
            if let Some(diff) = &result.display_diff {
                if !diff.is_empty() {
                    self.ui.diff(diff);
                }
            }

            self.push(Message::tool_result(call.id.clone(), result.output));
        }
    }

    // ── Handover ──────────────────────────────────────────────────────────────

    /// Ask the model for a summary, then reset the conversation around it.
    /// Returns the composed continuation prompt, or `None` when the summary
    /// was cancelled or empty (conversation left intact).
    async fn summarize_and_reset(&mut self, instructions: Option<&str>) -> Result<Option<String>> {
        self.push(Message::user(SUMMARY_PROMPT));
        self.ui.set_running(true);
        let cancel = self.ui.begin_run();
        self.ui.thinking(true);

        let outcome = self.stream_step(&cancel).await;
        self.ui.end_stream();
        self.ui.thinking(false);
        self.ui.set_running(false);

        let summary = match outcome {
            Ok(step) => step.text,
            Err(e) => {
                self.ui.error(&e.to_string());
                self.logger.error(&e.to_string());
                String::new()
            }
        };

        if summary.trim().is_empty() || cancel.is_cancelled() {
            // Roll back the synthesized request; the conversation survives.
            self.conversation.pop();
            return Ok(None);
        }

        self.logger.assistant_message(&summary, &[]);
        self.conversation.clear();
        self.last_input_tokens = 0;
        self.ui.banner("handover — conversation reset, system prompt preserved");

        let mut composed = format!(
            "Continue working on the task. Here's a summary of what was done previously:\n\n{}",
            summary.trim()
        );
        if let Some(extra) = instructions {
            if !extra.trim().is_empty() {
                composed.push_str(&format!("\n\nAdditional instructions: {}", extra.trim()));
            }
        }
        Ok(Some(composed))
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn push(&mut self, msg: Message) {
        self.logger.message(&msg);
        self.conversation.push(msg);
    }

    fn over_threshold(&self) -> bool {
        if !self.handover_enabled {
            return false;
        }
        match self.context_window {
            Some(window) if window > 0 => {
                self.last_input_tokens as f32 / window as f32 >= self.handover_threshold
            }
            _ => false,
        }
    }

    fn has_queued_input(&mut self) -> bool {
        // Peek by draining into the conversation immediately: interjections
        // are drained at the top of each step, so here we only need to know
        // whether anything is waiting.
        let queued = self.ui.drain_input();
        if queued.is_empty() {
            return false;
        }
        // Re-inject as the interjection for the next step.
        let joined = queued.join("\n");
        self.ui.info(&format!("↳ {joined}"));
        // Deliberately a separate message from the eventual next turn.
        self.push_interjection(joined);
        true
    }

    fn drain_interjections(&mut self) {
        let queued = self.ui.drain_input();
        if queued.is_empty() {
            return;
        }
        let joined = queued.join("\n");
        self.ui.info(&format!("↳ {joined}"));
        self.push_interjection(joined);
    }

    fn push_interjection(&mut self, joined: String) {
        self.push(Message::user(joined));
    }

    #[cfg(test)]
    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }
}

#[derive(Default)]
struct StepOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
}

/// Compact `key=value` rendering of tool arguments for the transcript.
fn args_summary(args: &Value) -> String {
    let Some(obj) = args.as_object() else {
        return args.to_string();
    };
    obj.iter()
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => format!("\"{}\"", clip(s, 48)),
                other => clip(&other.to_string(), 48),
            };
            format!("{k}={rendered}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn clip(s: &str, max: usize) -> String {
    let flat = s.replace('\n', "⏎");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max - 1).collect();
        format!("{cut}…")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
