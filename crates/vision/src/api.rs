//! The vision capability and model-catalog types.

use std::time::Duration;

use async_trait::async_trait;
use photoflow_core::ImageMetadata;
use serde::Deserialize;

/// Vision-adapter failures.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// The request body could not be serialized.
    #[error("serialize request: {0}")]
    Marshal(#[source] serde_json::Error),
    /// The request never produced an HTTP response.
    #[error("send request: {0}")]
    Transport(#[source] reqwest::Error),
    /// 429 from the upstream; `retry_after` honors the reset header when
    /// the server sent one.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long the caller should wait before the next attempt.
        retry_after: Duration,
    },
    /// 5xx from the upstream.
    #[error("server error {status}: {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, for the logs.
        body: String,
    },
    /// Terminal 4xx from the upstream.
    #[error("request rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for the logs.
        body: String,
    },
    /// The response body was not the expected JSON shape.
    #[error("decode response: {0}")]
    Decode(#[source] reqwest::Error),
    /// The response carried no choices.
    #[error("response contained no choices")]
    EmptyResponse,
    /// The model's text content was not metadata JSON.
    #[error("model output is not metadata JSON: {0}")]
    MetadataParse(String),
    /// The catalog was empty.
    #[error("model catalog is empty")]
    NoModels,
    /// No free model qualifies, even under the relaxed fallback filter.
    #[error("no free vision-capable models available")]
    NoFreeVisionModels,
    /// The selector has not completed a successful update yet.
    #[error("no model selected yet")]
    NoModelYet,
}

impl VisionError {
    /// Whether the retry loop should try again on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VisionError::Transport(_) | VisionError::RateLimited { .. } | VisionError::Server { .. }
        )
    }
}

/// One catalog entry from the model listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Model {
    /// Provider-scoped model id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Context window, tokens.
    #[serde(default)]
    pub context_length: u64,
    /// Pricing block.
    #[serde(default)]
    pub pricing: Pricing,
    /// Architecture block.
    #[serde(default)]
    pub architecture: Architecture,
}

/// Per-token pricing as the catalog reports it (decimal strings).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pricing {
    /// Prompt-token price; `"0"` or empty means free.
    #[serde(default)]
    pub prompt: String,
}

/// Model architecture hints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Architecture {
    /// Modality string, e.g. `text+image->text`.
    #[serde(default)]
    pub modality: String,
}

impl Model {
    fn is_free(&self) -> bool {
        self.pricing.prompt.is_empty() || self.pricing.prompt == "0"
    }

    fn looks_vision_capable(&self) -> bool {
        ["multimodal", "image", "vision"].iter().any(|needle| {
            self.architecture.modality.to_lowercase().contains(needle)
                || self.id.to_lowercase().contains(needle)
                || self.name.to_lowercase().contains(needle)
        })
    }
}

/// What the analyzer needs from a vision backend.
#[async_trait]
pub trait VisionApi: Send + Sync {
    /// Describe `image` (JPEG or PNG bytes) with the given model, returning
    /// structured metadata. `trace_id` is threaded into logs only.
    async fn analyze_image(
        &self,
        image: &[u8],
        model: &str,
        trace_id: &str,
    ) -> Result<ImageMetadata, VisionError>;

    /// Fetch the model catalog.
    async fn list_models(&self) -> Result<Vec<Model>, VisionError>;
}

/// Pick the best free vision model from a catalog listing.
///
/// Free models that advertise image support (modality, id, or name mentions
/// `multimodal`/`image`/`vision`) win; when none do, any free model with a
/// non-zero context window is acceptable. Ties break toward the largest
/// context window.
pub fn select_best_free_vision_model(models: &[Model]) -> Result<String, VisionError> {
    if models.is_empty() {
        return Err(VisionError::NoModels);
    }

    let mut candidates: Vec<&Model> = models
        .iter()
        .filter(|m| m.is_free() && m.looks_vision_capable())
        .collect();
    if candidates.is_empty() {
        candidates = models
            .iter()
            .filter(|m| m.is_free() && m.context_length > 0)
            .collect();
    }
    if candidates.is_empty() {
        return Err(VisionError::NoFreeVisionModels);
    }

    candidates.sort_by(|a, b| b.context_length.cmp(&a.context_length));
    Ok(candidates[0].id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str, prompt_price: &str, modality: &str, context: u64) -> Model {
        Model {
            id: id.to_string(),
            name: String::new(),
            context_length: context,
            pricing: Pricing {
                prompt: prompt_price.to_string(),
            },
            architecture: Architecture {
                modality: modality.to_string(),
            },
        }
    }

    #[test]
    fn empty_catalog_errors() {
        assert!(matches!(
            select_best_free_vision_model(&[]),
            Err(VisionError::NoModels)
        ));
    }

    #[test]
    fn paid_models_are_skipped() {
        let models = vec![model("paid/vision", "0.002", "text+image->text", 100_000)];
        assert!(matches!(
            select_best_free_vision_model(&models),
            Err(VisionError::NoFreeVisionModels)
        ));
    }

    #[test]
    fn largest_free_vision_context_wins() {
        let models = vec![
            model("a/small-vision", "0", "text+image->text", 8_192),
            model("b/big-vision", "", "multimodal", 131_072),
            model("c/paid-vision", "0.01", "multimodal", 1_000_000),
        ];
        assert_eq!(select_best_free_vision_model(&models).unwrap(), "b/big-vision");
    }

    #[test]
    fn id_and_name_also_mark_vision_capability() {
        let by_id = vec![model("x/some-vision-9b", "0", "text->text", 4_096)];
        assert_eq!(select_best_free_vision_model(&by_id).unwrap(), "x/some-vision-9b");

        let mut by_name = model("y/opaque", "0", "text->text", 4_096);
        by_name.name = "Opaque Image Preview".to_string();
        assert_eq!(
            select_best_free_vision_model(&[by_name]).unwrap(),
            "y/opaque"
        );
    }

    #[test]
    fn falls_back_to_any_free_model_with_context() {
        let models = vec![
            model("t/text-only", "0", "text->text", 32_768),
            model("t/no-context", "0", "text->text", 0),
        ];
        assert_eq!(select_best_free_vision_model(&models).unwrap(), "t/text-only");
    }

    #[test]
    fn unknown_catalog_fields_are_ignored() {
        let raw = serde_json::json!({
            "id": "z/model",
            "context_length": 1024,
            "pricing": {"prompt": "0", "completion": "0"},
            "architecture": {"modality": "multimodal", "tokenizer": "Llama"},
            "per_request_limits": null
        });
        let parsed: Model = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.id, "z/model");
        assert!(parsed.looks_vision_capable());
    }
}
