//! OpenRouter chat-completion client.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use photoflow_core::ImageMetadata;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{Model, VisionApi, VisionError};

/// OpenRouter client settings; every field has a production default.
#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    /// Bearer token.
    pub api_key: String,
    /// API base, no trailing slash.
    pub base_url: String,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// System prompt steering the model toward metadata JSON.
    pub prompt: String,
    /// Per-attempt request timeout.
    pub attempt_timeout: Duration,
    /// Retry budget, attempts.
    pub max_attempts: u32,
    /// Base unit for exponential backoff (`base · 2^(attempt-1)`).
    pub backoff_base: Duration,
    /// Wait after a 429 without a usable reset header.
    pub rate_limit_fallback: Duration,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            max_tokens: 500,
            temperature: 0.7,
            prompt: DEFAULT_PROMPT.to_string(),
            attempt_timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            rate_limit_fallback: Duration::from_secs(5),
        }
    }
}

/// Default system prompt.
pub const DEFAULT_PROMPT: &str = "You are an image cataloguer. Respond with a single JSON object \
     with keys \"title\" (short string), \"description\" (one or two sentences) and \
     \"keywords\" (array of strings, most relevant first). No other text.";

/// HTTP implementation of [`VisionApi`] against OpenRouter.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    config: OpenRouterConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<Model>,
}

impl OpenRouterClient {
    /// Build a client; fails only if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(config: OpenRouterConfig) -> Result<Self, VisionError> {
        let http = reqwest::Client::builder()
            .timeout(config.attempt_timeout)
            .build()
            .map_err(VisionError::Transport)?;
        Ok(Self { http, config })
    }

    /// Wait time before the next attempt for a retryable error.
    fn retry_wait(&self, err: &VisionError, attempt: u32) -> Duration {
        match err {
            VisionError::RateLimited { retry_after } => *retry_after,
            _ => self.config.backoff_base * 2u32.pow(attempt.saturating_sub(1)),
        }
    }

    fn rate_limited(&self, response: &reqwest::Response) -> VisionError {
        let retry_after = response
            .headers()
            .get("X-RateLimit-Reset")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_reset)
            .unwrap_or(self.config.rate_limit_fallback);
        VisionError::RateLimited { retry_after }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, VisionError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(self.rate_limited(&response));
        }
        if status.is_server_error() {
            return Err(VisionError::Server {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            return Err(VisionError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    async fn post_chat(&self, body: &serde_json::Value) -> Result<ImageMetadata, VisionError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(VisionError::Transport)?;
        let response = self.check_status(response).await?;

        let chat: ChatResponse = response.json().await.map_err(VisionError::Decode)?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(VisionError::EmptyResponse)?;
        parse_metadata(content)
    }

    async fn get_models(&self) -> Result<Vec<Model>, VisionError> {
        let response = self
            .http
            .get(format!("{}/models", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(VisionError::Transport)?;
        let response = self.check_status(response).await?;

        let list: ModelList = response.json().await.map_err(VisionError::Decode)?;
        Ok(list.data)
    }
}

#[async_trait::async_trait]
impl VisionApi for OpenRouterClient {
    async fn analyze_image(
        &self,
        image: &[u8],
        model: &str,
        trace_id: &str,
    ) -> Result<ImageMetadata, VisionError> {
        let data_url = format!("data:image/jpeg;base64,{}", B64.encode(image));
        let body = json!({
            "model": model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "system", "content": self.config.prompt},
                {"role": "user", "content": [
                    {"type": "text", "text": "Generate metadata for this image."},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]}
            ]
        });
        debug!(trace_id, model, image_bytes = image.len(), "vision request");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_chat(&body).await {
                Ok(metadata) => return Ok(metadata),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let wait = self.retry_wait(&err, attempt);
                    warn!(
                        trace_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "vision request failed, retrying: {err}"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<Model>, VisionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get_models().await {
                Ok(models) => return Ok(models),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let wait = self.retry_wait(&err, attempt);
                    warn!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "model listing failed, retrying: {err}"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Parse an `X-RateLimit-Reset` value: unix seconds or an RFC3339 stamp.
fn parse_reset(value: &str) -> Option<Duration> {
    let reset: DateTime<Utc> = if let Ok(secs) = value.parse::<i64>() {
        DateTime::from_timestamp(secs, 0)?
    } else {
        DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc)
    };
    let wait = reset - Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Parse the model's text content as metadata JSON, tolerating markdown
/// code fences around the object.
fn parse_metadata(content: &str) -> Result<ImageMetadata, VisionError> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    let metadata: ImageMetadata = serde_json::from_str(stripped)
        .map_err(|err| VisionError::MetadataParse(err.to_string()))?;
    if metadata.is_empty() {
        return Err(VisionError::MetadataParse("all fields empty".to_string()));
    }
    Ok(metadata)
}
