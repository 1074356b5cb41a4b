pub mod chat;
use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::fmt;

/// Inference providers the relay can route a chat request to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    SoulGraph,
    OpenAI,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::SoulGraph => "soulgraph",
            Provider::OpenAI => "openai",
        }
    }

    /// Relay route serving this provider.
    pub fn route(&self) -> &'static str {
        match self {
            Provider::SoulGraph => "/api/soulgraph",
            Provider::OpenAI => "/api/openai",
        }
    }

    /// Id used when neither the caller nor the provider supplied one.
    pub fn synthesize_thread_id(&self) -> String {
        format!("{}-{}", self.as_str(), chrono::Utc::now().timestamp_millis())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseProviderError {
    message: String,
}

impl fmt::Display for ParseProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseProviderError {}

impl FromStr for Provider {
    type Err = ParseProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "soulgraph" => Ok(Provider::SoulGraph),
            "openai" => Ok(Provider::OpenAI),
            _ =>
                Err(ParseProviderError {
                    message: format!("Invalid provider: '{}'", s),
                }),
        }
    }
}
