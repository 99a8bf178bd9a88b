#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Vision-model access for the analyzer: a capability trait over the
//! chat-completion API, the OpenRouter HTTP implementation with its
//! retry/rate-limit discipline, free-model selection rules, and a cached
//! background selector.

pub mod api;
pub mod openrouter;
pub mod selector;

pub use api::{Model, VisionApi, VisionError, select_best_free_vision_model};
pub use openrouter::{OpenRouterClient, OpenRouterConfig};
pub use selector::{ModelSelector, SelectedModel};
