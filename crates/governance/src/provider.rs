use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of AI backends the relay knows how to drive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    Groq,
    #[serde(rename = "deepseek")]
    DeepSeek,
    Ollama,
    Blackbox,
    Windsurf,
}

impl BackendKind {
    pub const ALL: [BackendKind; 8] = [
        BackendKind::Claude,
        BackendKind::OpenAi,
        BackendKind::Gemini,
        BackendKind::Groq,
        BackendKind::DeepSeek,
        BackendKind::Ollama,
        BackendKind::Blackbox,
        BackendKind::Windsurf,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::OpenAi => "openai",
            BackendKind::Gemini => "gemini",
            BackendKind::Groq => "groq",
            BackendKind::DeepSeek => "deepseek",
            BackendKind::Ollama => "ollama",
            BackendKind::Blackbox => "blackbox",
            BackendKind::Windsurf => "windsurf",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown backend: {0}")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        BackendKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownBackend(value.to_string()))
    }
}

/// Where and how to reach one backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
    /// Name of the environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}
