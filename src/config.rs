//! Runtime configuration: CLI flags merged over `NAV_*` environment
//! variables, plus provider auto-detection from the model name.
//!
//! Priority: CLI args > env vars > built-in defaults. Config *files* are out
//! of scope here — the rest of the program only ever sees a `ResolvedConfig`.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::client::{anthropic::AnthropicClient, ollama, ollama::OllamaClient, openai::OpenAiClient, LlmClient};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_HANDOVER_THRESHOLD: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "ollama" => Ok(Provider::Ollama),
            other => bail!("unknown provider '{other}' — expected openai, anthropic or ollama"),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::OpenAi => write!(f, "openai"),
            Provider::Anthropic => write!(f, "anthropic"),
            Provider::Ollama => write!(f, "ollama"),
        }
    }
}

/// Guess the provider from the model name when none is given explicitly.
pub fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.contains("claude") {
        return Provider::Anthropic;
    }
    const LOCAL_FAMILIES: &[&str] = &[
        "llama", "mistral", "qwen", "gemma", "phi", "deepseek", "codellama", "vicuna",
        "starcoder", "yi",
    ];
    if LOCAL_FAMILIES.iter().any(|f| m.contains(f)) {
        return Provider::Ollama;
    }
    if m.contains("gpt") || m.contains("o1") || m.contains("o3") {
        return Provider::OpenAi;
    }
    Provider::OpenAi
}

fn default_base_url(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAi => "https://api.openai.com",
        Provider::Anthropic => "https://api.anthropic.com",
        Provider::Ollama => ollama::DEFAULT_BASE_URL,
    }
}

// ── Resolved configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub model: String,
    pub provider: Provider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub verbose: bool,
    pub sandbox: bool,
    pub enable_handover: bool,
    pub context_window: Option<u32>,
    pub handover_threshold: f32,
}

impl ResolvedConfig {
    /// Merge explicit overrides (CLI flags, `/model` arguments) with the
    /// environment. Clap already folds `NAV_MODEL`/`NAV_PROVIDER`/
    /// `NAV_BASE_URL`/`NAV_API_KEY` into the override slots; the remaining
    /// env vars are read here.
    pub fn resolve(
        model: Option<&str>,
        provider: Option<Provider>,
        base_url: Option<&str>,
        api_key: Option<&str>,
        verbose: bool,
        sandbox_flag: bool,
        enable_handover: bool,
    ) -> Self {
        let model = model.unwrap_or(DEFAULT_MODEL).to_string();
        let provider = provider.unwrap_or_else(|| detect_provider(&model));
        // Env fallbacks repeat what clap does at startup so that mid-session
        // re-resolution (`/model`) sees the same environment.
        let base_url = base_url
            .map(str::to_string)
            .or_else(|| std::env::var("NAV_BASE_URL").ok())
            .unwrap_or_else(|| default_base_url(provider).to_string());

        let api_key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("NAV_API_KEY").ok())
            .or_else(|| match provider {
                Provider::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
                Provider::Anthropic => std::env::var("ANTHROPIC_API_KEY").ok(),
                Provider::Ollama => None,
            });

        let sandbox = sandbox_flag || env_flag("NAV_SANDBOX");
        let context_window = std::env::var("NAV_CONTEXT_WINDOW")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|n| *n > 0);
        let handover_threshold = std::env::var("NAV_HANDOVER_THRESHOLD")
            .ok()
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|t| (0.0..=1.0).contains(t))
            .unwrap_or(DEFAULT_HANDOVER_THRESHOLD);

        Self {
            model,
            provider,
            base_url,
            api_key,
            verbose,
            sandbox,
            enable_handover,
            context_window,
            handover_threshold,
        }
    }

    /// Construct the provider adapter this config describes.
    pub fn client(&self) -> Result<Box<dyn LlmClient>> {
        match self.provider {
            Provider::OpenAi => Ok(Box::new(OpenAiClient::new(
                self.base_url.clone(),
                self.model.clone(),
                self.api_key.clone(),
            ))),
            Provider::Anthropic => {
                let Some(key) = self.api_key.clone() else {
                    bail!("no API key for anthropic — set NAV_API_KEY or ANTHROPIC_API_KEY");
                };
                Ok(Box::new(AnthropicClient::new(
                    self.base_url.clone(),
                    self.model.clone(),
                    key,
                )))
            }
            Provider::Ollama => Ok(Box::new(OllamaClient::new(
                self.base_url.clone(),
                self.model.clone(),
            ))),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref().map(str::trim),
        Some("1") | Some("true")
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_models_detect_anthropic() {
        assert_eq!(detect_provider("claude-sonnet-4-5"), Provider::Anthropic);
        assert_eq!(detect_provider("CLAUDE-opus"), Provider::Anthropic);
    }

    #[test]
    fn local_families_detect_ollama() {
        for m in ["llama3:8b", "mistral-nemo", "qwen3:14b", "gemma2", "phi4", "deepseek-r1", "codellama", "vicuna-13b", "starcoder2", "yi-coder"] {
            assert_eq!(detect_provider(m), Provider::Ollama, "{m}");
        }
    }

    #[test]
    fn gpt_and_unknown_detect_openai() {
        assert_eq!(detect_provider("gpt-4o"), Provider::OpenAi);
        assert_eq!(detect_provider("o3-mini"), Provider::OpenAi);
        assert_eq!(detect_provider("totally-new-model"), Provider::OpenAi);
    }

    #[test]
    fn provider_parse_round_trips() {
        for p in [Provider::OpenAi, Provider::Anthropic, Provider::Ollama] {
            assert_eq!(p.to_string().parse::<Provider>().unwrap(), p);
        }
        assert!("azure".parse::<Provider>().is_err());
    }

    #[test]
    fn explicit_provider_beats_detection() {
        let cfg = ResolvedConfig::resolve(
            Some("claude-sonnet-4-5"),
            Some(Provider::Ollama),
            None,
            None,
            false,
            false,
            false,
        );
        assert_eq!(cfg.provider, Provider::Ollama);
        assert_eq!(cfg.base_url, ollama::DEFAULT_BASE_URL);
    }

    #[test]
    fn base_url_override_survives_resolution() {
        let cfg = ResolvedConfig::resolve(
            Some("gpt-4o"),
            None,
            Some("http://proxy.local:8080"),
            Some("sk-test"),
            false,
            false,
            false,
        );
        assert_eq!(cfg.base_url, "http://proxy.local:8080");
        assert_eq!(cfg.api_key.as_deref(), Some("sk-test"));
    }
}
