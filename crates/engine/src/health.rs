//! Component health for the `/health` surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use photoflow_exiftool::ExifTool;
use serde::Serialize;

use crate::queue::Publisher;
use crate::storage::ObjectStore;
use crate::worker::PoolHealth;

/// Component verdict.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Working.
    Ok,
    /// Reachable service, broken component.
    Degraded,
}

/// One component's line in the health map.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Verdict.
    pub status: HealthState,
    /// Human-readable detail.
    pub details: String,
    /// Error rendering, present when degraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn ok(details: impl Into<String>) -> Self {
        Self {
            status: HealthState::Ok,
            details: details.into(),
            error: None,
        }
    }

    fn degraded(details: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Degraded,
            details: details.into(),
            error: Some(error.into()),
        }
    }
}

/// Full health report; `healthy` is false when any component degraded.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub healthy: bool,
    /// Per-component verdicts.
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Probes every pipeline dependency on demand.
pub struct HealthChecker {
    publisher: Arc<Publisher>,
    store: Arc<ObjectStore>,
    exiftool: ExifTool,
    pools: Vec<PoolHealth>,
}

impl HealthChecker {
    /// Wire the checker to the live components.
    pub fn new(
        publisher: Arc<Publisher>,
        store: Arc<ObjectStore>,
        exiftool: ExifTool,
        pools: Vec<PoolHealth>,
    ) -> Self {
        Self {
            publisher,
            store,
            exiftool,
            pools,
        }
    }

    /// Run every probe and assemble the component map.
    pub async fn check(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        components.insert(
            "rabbitmq_publisher".to_string(),
            if self.publisher.connected().await {
                ComponentHealth::ok(format!("publishing to {}", self.publisher.queue()))
            } else {
                ComponentHealth::degraded("publisher channel down", "not connected")
            },
        );

        let mut consumer_ok = true;
        for pool in &self.pools {
            if !pool.any_connected().await {
                consumer_ok = false;
            }
        }
        components.insert(
            "rabbitmq_consumer".to_string(),
            if consumer_ok {
                ComponentHealth::ok("all stages consuming")
            } else {
                ComponentHealth::degraded("a stage lost its broker channel", "not connected")
            },
        );

        components.insert(
            "minio".to_string(),
            match self.store.probe().await {
                Ok(()) => ComponentHealth::ok("bucket reachable"),
                Err(err) => ComponentHealth::degraded("object store unreachable", err.to_string()),
            },
        );

        components.insert(
            "exiftool".to_string(),
            match self.exiftool.version().await {
                Ok(version) => ComponentHealth::ok(format!("exiftool {version}")),
                Err(err) => ComponentHealth::degraded("exiftool unavailable", err.to_string()),
            },
        );

        let running: usize = self.pools.iter().map(|p| p.running()).sum();
        let configured: usize = self.pools.iter().map(|p| p.configured()).sum();
        components.insert(
            "workers".to_string(),
            if running == configured && configured > 0 {
                ComponentHealth::ok(format!("{running}/{configured} workers running"))
            } else {
                ComponentHealth::degraded(
                    format!("{running}/{configured} workers running"),
                    "worker loops exited",
                )
            },
        );

        let healthy = components
            .values()
            .all(|c| c.status == HealthState::Ok);
        HealthReport { healthy, components }
    }
}
