use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the stages of a pipeline.
///
/// A sync pipeline is a handful of independent loops handing items to each
/// other through bounded queues. If one loop wedges, the queues feeding it
/// fill up and everything upstream blocks on backpressure, without any error
/// being raised. The registry makes that visible: every stage registers a
/// component and heartbeats from its loop, and the process status is
/// derived from the individual statuses:
///   - a component that reported unhealthy fails the check,
///   - a component whose last heartbeat is older than its deadline is
///     reported as stalled and fails the check,
///   - a component that announced a clean exit is ignored, a stopped
///     pipeline is not a dead process.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if no registered component is failing
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise. The body lists every component.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first heartbeat
    Starting,
    /// Heartbeat received, valid until the given instant
    HealthyUntil(time::OffsetDateTime),
    /// Explicitly reported unhealthy
    Unhealthy,
    /// The HealthyUntil deadline passed without a new heartbeat
    Stalled,
    /// The component exited its loop on purpose
    Stopped,
}

impl ComponentStatus {
    fn is_failing(&self, now: time::OffsetDateTime) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.le(&now),
            ComponentStatus::Stopped => false,
            _ => true,
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

/// Handed to a stage so it can heartbeat. Cheap to clone.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy until now + deadline. Must be called more often than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Report a clean exit from the component loop.
    pub async fn report_stopped(&self) {
        self.report_status(ComponentStatus::Stopped).await
    }

    /// Returns when the message is queued, not when the registry applied it.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime, the registry spawns its update loop.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(64);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => _ = map.insert(message.component, message.status),
                    // Poisoned lock: the probe keeps failing and the process gets restarted
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Register a component, the returned handle should be moved into its loop.
    /// Registering an existing name resets it to `Starting`.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status computed from all registered components. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned HealthRegistry lock");
                return HealthStatus::default();
            }
        };

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if until.le(&now) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if status.is_failing(now) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        assert_or_retry_for_duration(check, Duration::from_secs(5)).await
    }

    async fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn stage_heartbeat_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("validator".to_string(), Duration::from_secs(30))
            .await;

        // Registered but no heartbeat yet
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("validator"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;

        // A heartbeat older than the deadline is reported as a stalled stage
        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| {
            registry.get_status().components.get("validator") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_stalled_stage_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let validator = registry
            .register("validator".to_string(), Duration::from_secs(30))
            .await;
        let dispatcher = registry
            .register("dispatcher".to_string(), Duration::from_secs(30))
            .await;

        validator.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("validator") != Some(&ComponentStatus::Starting)
        })
        .await;
        // The dispatcher never reported
        assert!(!registry.get_status().healthy);

        dispatcher.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stopped_stages_do_not_fail_the_check() {
        let registry = HealthRegistry::new("liveness");
        let transformer = registry
            .register("transformer".to_string(), Duration::from_secs(30))
            .await;

        transformer.report_stopped().await;
        assert_or_retry(|| registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("transformer"),
            Some(&ComponentStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
