use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use health::HealthRegistry;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use contact_worker::config::Config;
use contact_worker::handlers::{add_routes, AppState};
use contact_worker::ingest::VecSource;
use contact_worker::pipeline::Pipeline;

/// Config pointed at `endpoint_base_url`, with short timeouts and fast retries.
pub fn test_config(endpoint_base_url: &str, extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("ENDPOINT_BASE_URL", endpoint_base_url),
        ("EVENTS_PER_SECOND", "1000"),
        ("MAX_RETRIES", "2"),
        ("INITIAL_INTERVAL", "1"),
        ("DEQUEUE_TIMEOUT", "20"),
        ("DRAIN_TIMEOUT", "2000"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    Config::load_from_hashmap(&vars).expect("failed to build test config")
}

pub fn contact_event(id: &str, operation: &str, category: &str) -> Value {
    json!({
        "record_kind": "contacts",
        "operation": operation,
        "timestamp": "2024-01-15T10:30:00Z",
        "payload": {
            "id": id,
            "name": "Grace Hopper",
            "email": "grace.hopper@navy.example.com",
            "phone": "+1-555-987-6543",
            "category": category,
            "created_at": "2024-01-15T10:30:00Z",
            "updated_at": "2024-01-16T08:00:00Z",
        }
    })
}

/// A started pipeline replaying `events`, with its routes served on a local port.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub pipeline: Arc<Pipeline>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config, events: Vec<Value>) -> ServerHandle {
        let liveness = HealthRegistry::new("liveness");
        let pipeline = Arc::new(
            Pipeline::from_config(&config, Box::new(VecSource::new(events)), liveness.clone())
                .expect("failed to build pipeline"),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = add_routes(
            Router::new(),
            AppState {
                pipeline: pipeline.clone(),
                liveness,
            },
        );
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("failed to serve test routes")
        });

        pipeline.start().await.expect("failed to start pipeline");

        ServerHandle {
            addr,
            pipeline,
            client: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }

    /// Poll `/stats` until `check` passes, panicking after a few seconds.
    pub async fn wait_for_stats<F>(&self, check: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats: Value = self.get("/stats").await.json().await.unwrap();
            if check(&stats) {
                return stats;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("stats never matched, last: {stats}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
