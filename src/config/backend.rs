// Backend profiles - static facts about each built-in provider

use serde::{Deserialize, Serialize};

/// Wire protocol family a backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFamily {
    OpenAI,
    Anthropic,
    Gemini,
}

/// Built-in backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI chat completions
    OpenAI,
    /// Anthropic messages API
    Anthropic,
    /// Google Gemini generateContent
    Gemini,
    /// Qwen portal (OpenAI-compatible, OAuth capable)
    Qwen,
    /// Self-hosted OpenAI-compatible server
    Local,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::OpenAI,
        BackendKind::Anthropic,
        BackendKind::Gemini,
        BackendKind::Qwen,
        BackendKind::Local,
    ];

    /// Look up a backend by name (case-insensitive, common aliases accepted)
    pub fn from_name(name: &str) -> Option<BackendKind> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(BackendKind::OpenAI),
            "anthropic" | "claude" => Some(BackendKind::Anthropic),
            "gemini" | "google" => Some(BackendKind::Gemini),
            "qwen" => Some(BackendKind::Qwen),
            "local" | "openai-compatible" => Some(BackendKind::Local),
            _ => None,
        }
    }

    /// Canonical settings key
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::OpenAI => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Gemini => "gemini",
            BackendKind::Qwen => "qwen",
            BackendKind::Local => "local",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::OpenAI => "OpenAI",
            BackendKind::Anthropic => "Anthropic",
            BackendKind::Gemini => "Google Gemini",
            BackendKind::Qwen => "Qwen",
            BackendKind::Local => "Self-hosted (OpenAI-compatible)",
        }
    }

    pub fn wire(&self) -> WireFamily {
        match self {
            BackendKind::OpenAI | BackendKind::Qwen | BackendKind::Local => WireFamily::OpenAI,
            BackendKind::Anthropic => WireFamily::Anthropic,
            BackendKind::Gemini => WireFamily::Gemini,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::OpenAI => "https://api.openai.com/v1",
            BackendKind::Anthropic => "https://api.anthropic.com",
            BackendKind::Gemini => "https://generativelanguage.googleapis.com",
            BackendKind::Qwen => "https://portal.qwen.ai/v1",
            BackendKind::Local => "http://localhost:1234/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            BackendKind::OpenAI => "gpt-4o",
            BackendKind::Anthropic => "claude-sonnet-4-20250514",
            BackendKind::Gemini => "gemini-2.5-flash",
            BackendKind::Qwen => "qwen3-coder-plus",
            BackendKind::Local => "local-model",
        }
    }

    /// Environment variables consulted for an API key, in order
    pub fn env_vars(&self) -> &'static [&'static str] {
        match self {
            BackendKind::OpenAI => &["OPENAI_API_KEY"],
            BackendKind::Anthropic => &["ANTHROPIC_API_KEY"],
            BackendKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            BackendKind::Qwen => &["QWEN_API_KEY", "DASHSCOPE_API_KEY"],
            BackendKind::Local => &["LOCAL_LLM_API_KEY"],
        }
    }

    pub fn supports_oauth(&self) -> bool {
        matches!(
            self,
            BackendKind::Anthropic | BackendKind::Gemini | BackendKind::Qwen
        )
    }

    /// Self-hosted servers have no sensible endpoint or model default
    pub fn requires_endpoint(&self) -> bool {
        matches!(self, BackendKind::Local)
    }

    /// Qwen output fragments badly; buffer text to natural breaks
    pub fn buffers_text(&self) -> bool {
        matches!(self, BackendKind::Qwen)
    }

    /// Backends whose models inline reasoning as `<think>` tags
    pub fn parses_think_tags(&self) -> bool {
        matches!(self, BackendKind::Qwen | BackendKind::Local)
    }

    /// Prefix for tool call ids in this backend's wire format
    pub fn native_tool_prefix(&self) -> &'static str {
        match self.wire() {
            WireFamily::OpenAI => "call_",
            WireFamily::Anthropic => "toolu_",
            WireFamily::Gemini => "",
        }
    }

    /// Models offered when the live model list cannot be fetched
    pub fn fallback_models(&self) -> &'static [&'static str] {
        match self {
            BackendKind::OpenAI => &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "o3-mini"],
            BackendKind::Anthropic => &[
                "claude-sonnet-4-20250514",
                "claude-opus-4-20250514",
                "claude-3-5-haiku-20241022",
            ],
            BackendKind::Gemini => &["gemini-2.5-flash", "gemini-2.5-pro", "gemini-2.0-flash"],
            BackendKind::Qwen => &["qwen3-coder-plus", "qwen3-coder-flash"],
            BackendKind::Local => &[],
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
