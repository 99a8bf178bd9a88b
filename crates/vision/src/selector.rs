//! Background selection of the current free vision model.
//!
//! The analyzer never talks to the catalog directly; it reads the cached id
//! from here. Updates run once at startup and then on a ticker, and a failed
//! update never clobbers a previously selected model.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{VisionApi, VisionError, select_best_free_vision_model};

/// The cached selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedModel {
    /// Model id, as the catalog reports it.
    pub id: String,
    /// When this id was selected.
    pub selected_at: DateTime<Utc>,
}

struct SelectorInner {
    client: Arc<dyn VisionApi>,
    fallback_id: Option<String>,
    current: RwLock<Option<SelectedModel>>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl SelectorInner {
    fn set_current(&self, id: String) {
        let mut slot = self.current.write().expect("selector lock poisoned");
        *slot = Some(SelectedModel {
            id,
            selected_at: Utc::now(),
        });
    }

    fn has_current(&self) -> bool {
        self.current.read().expect("selector lock poisoned").is_some()
    }

    async fn update(&self) {
        let selected = match self.client.list_models().await {
            Ok(models) => select_best_free_vision_model(&models),
            Err(err) => Err(err),
        };

        match selected {
            Ok(id) => {
                info!(model = %id, "selected vision model");
                self.set_current(id);
            }
            Err(err) => {
                if !self.has_current() {
                    if let Some(fallback) = &self.fallback_id {
                        warn!("model selection failed, using fallback {fallback}: {err}");
                        self.set_current(fallback.clone());
                        return;
                    }
                }
                warn!("model selection failed, keeping previous selection: {err}");
            }
        }
    }
}

/// Handle to the background selection loop.
pub struct ModelSelector {
    inner: Arc<SelectorInner>,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ModelSelector {
    /// Start the loop: one immediate update, then one per `check_interval`.
    /// An empty `fallback_id` means no fallback.
    pub fn start(
        client: Arc<dyn VisionApi>,
        check_interval: Duration,
        fallback_id: Option<String>,
    ) -> Self {
        let inner = Arc::new(SelectorInner {
            client,
            fallback_id: fallback_id.filter(|id| !id.is_empty()),
            current: RwLock::new(None),
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        });

        let loop_inner = inner.clone();
        let join = tokio::spawn(async move {
            loop_inner.update().await;

            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.reset();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if loop_inner.stop_requested.load(Ordering::SeqCst) {
                            return;
                        }
                        loop_inner.update().await;
                    }
                    _ = loop_inner.notify.notified() => return,
                }
            }
        });

        Self {
            inner,
            join: std::sync::Mutex::new(Some(join)),
        }
    }

    /// The currently selected model id.
    pub fn current_model(&self) -> Result<String, VisionError> {
        self.inner
            .current
            .read()
            .expect("selector lock poisoned")
            .as_ref()
            .map(|m| m.id.clone())
            .ok_or(VisionError::NoModelYet)
    }

    /// The full cached selection, if any.
    pub fn current(&self) -> Option<SelectedModel> {
        self.inner
            .current
            .read()
            .expect("selector lock poisoned")
            .clone()
    }

    /// Signal the loop and wait for it to drain. Later calls are no-ops.
    pub async fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a stop raced against an in-flight
        // update still lands.
        self.inner.notify.notify_one();
        let join = self.join.lock().expect("selector join lock poisoned").take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Architecture, Model, Pricing};
    use photoflow_core::ImageMetadata;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedCatalog {
        responses: Mutex<VecDeque<Result<Vec<Model>, VisionError>>>,
    }

    impl ScriptedCatalog {
        fn new(responses: Vec<Result<Vec<Model>, VisionError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl VisionApi for ScriptedCatalog {
        async fn analyze_image(
            &self,
            _image: &[u8],
            _model: &str,
            _trace_id: &str,
        ) -> Result<ImageMetadata, VisionError> {
            unreachable!("selector never analyzes images")
        }

        async fn list_models(&self) -> Result<Vec<Model>, VisionError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(VisionError::NoModels))
        }
    }

    fn free_vision(id: &str, context: u64) -> Model {
        Model {
            id: id.to_string(),
            name: String::new(),
            context_length: context,
            pricing: Pricing {
                prompt: "0".to_string(),
            },
            architecture: Architecture {
                modality: "text+image->text".to_string(),
            },
        }
    }

    fn inner(client: Arc<dyn VisionApi>, fallback: Option<&str>) -> SelectorInner {
        SelectorInner {
            client,
            fallback_id: fallback.map(str::to_string),
            current: RwLock::new(None),
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    #[tokio::test]
    async fn successful_update_caches_the_selection() {
        let client = ScriptedCatalog::new(vec![Ok(vec![free_vision("a/v", 8192)])]);
        let selector = inner(client, None);
        selector.update().await;
        assert_eq!(
            selector.current.read().unwrap().as_ref().unwrap().id,
            "a/v"
        );
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_selection() {
        let client = ScriptedCatalog::new(vec![
            Ok(vec![free_vision("a/v", 8192)]),
            Err(VisionError::Server {
                status: 500,
                body: String::new(),
            }),
        ]);
        let selector = inner(client, Some("fallback/model"));
        selector.update().await;
        selector.update().await;
        // The fallback only applies before any successful selection.
        assert_eq!(
            selector.current.read().unwrap().as_ref().unwrap().id,
            "a/v"
        );
    }

    #[tokio::test]
    async fn fallback_applies_when_nothing_was_ever_selected() {
        let client = ScriptedCatalog::new(vec![Err(VisionError::NoModels)]);
        let selector = inner(client, Some("fallback/model"));
        selector.update().await;
        assert_eq!(
            selector.current.read().unwrap().as_ref().unwrap().id,
            "fallback/model"
        );
    }

    #[tokio::test]
    async fn no_fallback_leaves_selection_unset() {
        let client = ScriptedCatalog::new(vec![Err(VisionError::NoModels)]);
        let selector = inner(client, None);
        selector.update().await;
        assert!(selector.current.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn handle_reports_no_model_until_an_update_lands() {
        let client = ScriptedCatalog::new(vec![Ok(vec![free_vision("a/v", 8192)])]);
        let selector = ModelSelector::start(client, Duration::from_secs(3600), None);

        // The immediate update runs on the spawned task; poll briefly.
        let mut model = selector.current_model();
        for _ in 0..50 {
            if model.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            model = selector.current_model();
        }
        assert_eq!(model.unwrap(), "a/v");
        assert!(selector.current().is_some());
        selector.stop().await;
    }
}
