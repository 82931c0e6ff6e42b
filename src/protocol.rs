use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ApiError;
use crate::generation::GenerationParams;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and harmless assistant. You are Qwen developed by Alibaba. You should think step-by-step.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// `None` when the field is absent, `Some(None)` when it is an explicit `null`.
    #[serde(default, deserialize_with = "present_or_null")]
    pub system_prompt: Option<Option<String>>,
}

fn default_max_tokens() -> usize {
    512
}

fn default_temperature() -> f64 {
    0.7
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max_tokens == 0 {
            return Err(ApiError::InvalidRequest(
                "max_tokens must be a positive integer".to_string(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ApiError::InvalidRequest(
                "temperature must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the system prompt against the server default. An empty result means
    /// no system message is sent.
    pub fn resolved_system_prompt<'a>(&'a self, default: &'a str) -> Option<&'a str> {
        let prompt = match &self.system_prompt {
            None => default,
            Some(None) => return None,
            Some(Some(prompt)) => prompt.as_str(),
        };
        (!prompt.is_empty()).then_some(prompt)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
    pub status: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Initializing,
    Ready,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
