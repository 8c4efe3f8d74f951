//! Chat-completions client that turns a system prompt into a `MealPlan`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LlmSettings;
use mealplan_core::models::MealPlan;

const MISTRAL_URL: &str = "https://api.mistral.ai/v1";
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

const USER_MESSAGE: &str = "Create the dinner plan now. Answer with the JSON object only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mistral,
    #[value(name = "openrouter")]
    #[serde(rename = "openrouter")]
    OpenRouter,
    Ollama,
}

impl Provider {
    #[must_use]
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Mistral => "mistral-small-latest",
            Provider::OpenRouter => "qwen/qwen3-235b-a22b-07-25:free",
            Provider::Ollama => {
                "hf.co/mradermacher/Qwen3-53B-A3B-TOTAL-RECALL-MASTER-CODER-v1.4-GGUF:latest"
            }
        }
    }

    fn label(self) -> &'static str {
        match self {
            Provider::Mistral => "Mistral",
            Provider::OpenRouter => "OpenRouter",
            Provider::Ollama => "Ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Mistral => "mistral",
            Provider::OpenRouter => "openrouter",
            Provider::Ollama => "ollama",
        })
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mistral" => Ok(Provider::Mistral),
            "openrouter" => Ok(Provider::OpenRouter),
            "ollama" => Ok(Provider::Ollama),
            other => anyhow::bail!(
                "Unknown LLM provider '{other}'. Must be one of: mistral, openrouter, ollama"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{provider} API key not found")]
    MissingApiKey { provider: &'static str },

    #[error("Model {model} not found")]
    ModelNotFound { model: String },

    #[error("Trying to use {model}, but got Unauthorized")]
    Unauthorized { model: String },

    #[error("Trying to use {model}, but got Forbidden")]
    Forbidden { model: String },

    #[error("Trying to use {model}, but got Too many requests")]
    RateLimited { model: String },

    #[error("Trying to use {model}, but got Internal server error")]
    ProviderError { model: String },

    #[error("Trying to use {model}, but got Unknown error (HTTP {status})")]
    Unknown { model: String, status: u16 },

    #[error("{model} returned an unusable plan: {reason}")]
    InvalidOutput { model: String, reason: String },

    #[error("Failed to reach {model}: {source}")]
    Transport {
        model: String,
        #[source]
        source: reqwest::Error,
    },
}

impl PlanError {
    /// HTTP status to report to API callers.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            PlanError::MissingApiKey { .. } => StatusCode::BAD_REQUEST,
            PlanError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            PlanError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            PlanError::Forbidden { .. } => StatusCode::FORBIDDEN,
            PlanError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PlanError::ProviderError { .. } | PlanError::Unknown { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PlanError::InvalidOutput { .. } | PlanError::Transport { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Map a non-success provider response.
    #[must_use]
    pub fn from_status(model: &str, status: StatusCode) -> Self {
        let model = model.to_string();
        match status {
            StatusCode::NOT_FOUND => PlanError::ModelNotFound { model },
            StatusCode::UNAUTHORIZED => PlanError::Unauthorized { model },
            StatusCode::FORBIDDEN => PlanError::Forbidden { model },
            StatusCode::TOO_MANY_REQUESTS => PlanError::RateLimited { model },
            StatusCode::INTERNAL_SERVER_ERROR => PlanError::ProviderError { model },
            other => PlanError::Unknown {
                model,
                status: other.as_u16(),
            },
        }
    }
}

/// Something that can turn a system prompt into a meal plan.
#[async_trait]
pub trait PlanProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, system_prompt: &str) -> Result<MealPlan, PlanError>;
}

// --- Wire types (OpenAI-compatible chat completions) ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Remove a surrounding Markdown code fence, if any.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json).
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the model's reply. Accepts `{"plan": [...]}` or a bare array.
pub fn parse_plan_content(content: &str) -> Result<MealPlan, String> {
    let body = strip_code_fence(content);
    if body.is_empty() {
        return Err("empty response".to_string());
    }
    match serde_json::from_str::<MealPlan>(body) {
        Ok(plan) => Ok(plan),
        Err(err) => serde_json::from_str(body)
            .map(|plan| MealPlan { plan })
            .map_err(|_| err.to_string()),
    }
}

pub struct ChatClient {
    client: reqwest::Client,
    provider: Provider,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("mealplan/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }

    /// Client for `provider` (or the configured one), using `model` (or the
    /// configured / provider default).
    #[must_use]
    pub fn from_settings(
        settings: &LlmSettings,
        provider: Option<Provider>,
        model: Option<String>,
    ) -> Self {
        let provider = provider.unwrap_or(settings.provider);
        // A configured model only applies to the configured provider.
        let configured = (provider == settings.provider)
            .then(|| settings.model.clone())
            .flatten();
        let model = model
            .or(configured)
            .unwrap_or_else(|| provider.default_model().to_string());
        let base_url = match provider {
            Provider::Mistral => MISTRAL_URL.to_string(),
            Provider::OpenRouter => OPENROUTER_URL.to_string(),
            Provider::Ollama => format!(
                "http://{}:{}/v1",
                settings.ollama_host, settings.ollama_port
            ),
        };
        let api_key = settings.api_key(provider).map(str::to_string);
        Self::new(provider, base_url, model, api_key)
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl PlanProvider for ChatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str) -> Result<MealPlan, PlanError> {
        if self.provider != Provider::Ollama && self.api_key.is_none() {
            return Err(PlanError::MissingApiKey {
                provider: self.provider.label(),
            });
        }

        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: USER_MESSAGE,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        info!(provider = %self.provider, model = %self.model, "Requesting meal plan");
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let transport = |source| PlanError::Transport {
            model: self.model.clone(),
            source,
        };
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            debug!(%status, "Provider returned an error");
            return Err(PlanError::from_status(&self.model, status));
        }

        let data: ChatResponse = resp.json().await.map_err(transport)?;
        let invalid = |reason: String| PlanError::InvalidOutput {
            model: self.model.clone(),
            reason,
        };
        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| invalid("no message in response".to_string()))?;
        let plan = parse_plan_content(&content).map_err(invalid)?;
        info!(days = plan.plan.len(), "Received meal plan");
        Ok(plan)
    }
}
