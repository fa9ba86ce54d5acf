//! # Pipeline
//!
//! Runs the sync pipeline: a feeder pulls raw events from an [`EventSource`] and the validator,
//! transformer and dispatcher stages each run as their own task, handing items to the next stage
//! through a bounded queue:
//!
//! ```text
//! source -> feeder -> raw -> validator -> validated -> transformer -> transformed -> dispatcher
//! ```
//!
//! Stopping cancels the shutdown token. The feeder exits immediately and drops its sender. Every
//! other stage keeps draining its queue and exits once the queue is closed, or once it is empty
//! after shutdown, closing the next queue in turn.
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use contact_common::event::ChangeEvent;
use contact_common::routing::RoutingTable;
use contact_common::transform::{TransformedRecord, Transformer};
use futures::FutureExt;
use health::{HealthHandle, HealthRegistry};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, PipelineError};
use crate::ingest::EventSource;
use crate::queue::{self, Received, StageReceiver, StageSender};
use crate::stats::{PipelineSnapshot, PipelineStats};
use crate::validator::{EventValidator, Verdict};

/// Runtime settings of the orchestrator.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub events_per_second: f64,
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// How long a stage waits on an empty queue before heartbeating and checking for shutdown.
    pub dequeue_timeout: time::Duration,
    /// How long `stop` waits for the stages to drain before aborting them.
    pub drain_timeout: time::Duration,
    pub stats_log_interval: time::Duration,
    pub liveness_deadline: time::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            events_per_second: 5.0,
            batch_size: 10,
            queue_capacity: 1000,
            dequeue_timeout: time::Duration::from_secs(1),
            drain_timeout: time::Duration::from_secs(5),
            stats_log_interval: time::Duration::from_secs(30),
            liveness_deadline: time::Duration::from_secs(30),
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            events_per_second: config.events_per_second,
            batch_size: config.batch_size,
            queue_capacity: config.queue_capacity,
            dequeue_timeout: config.dequeue_timeout.0,
            drain_timeout: config.drain_timeout.0,
            stats_log_interval: config.stats_log_interval.0,
            liveness_deadline: config.liveness_deadline.0,
        }
    }
}

/// The feeder never pulls batches faster than this, however high the rate.
const MIN_BATCH_INTERVAL: time::Duration = time::Duration::from_millis(1);

impl PipelineConfig {
    /// Reject settings the stages cannot run with: queues need room for at least one item, the
    /// feeder needs a positive rate and batch size, and the stage timers need a non-zero period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.events_per_second.is_finite() && self.events_per_second > 0.0) {
            return Err(ConfigError::NonPositiveRate(self.events_per_second));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.dequeue_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("dequeue timeout"));
        }
        if self.stats_log_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("stats log interval"));
        }

        Ok(())
    }

    /// Time between two batches for the feeder to produce `events_per_second` on average.
    pub fn batch_interval(&self) -> time::Duration {
        time::Duration::try_from_secs_f64(self.batch_size as f64 / self.events_per_second)
            .unwrap_or(time::Duration::from_secs(1))
            .max(MIN_BATCH_INTERVAL)
    }
}

/// State shared by every stage task.
struct Shared {
    validator: EventValidator,
    transformer: Transformer,
    dispatcher: Dispatcher,
    stats: PipelineStats,
    running: AtomicBool,
}

impl Shared {
    fn snapshot(&self) -> PipelineSnapshot {
        self.stats.snapshot(
            self.running.load(Ordering::Relaxed),
            self.validator.counts(),
            self.transformer.routing().snapshot(),
        )
    }
}

/// Handles of one run, from `start` to `stop`.
struct Run {
    shutdown: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<Mutex<Box<dyn EventSource>>>,
    shared: Arc<Shared>,
    liveness: HealthRegistry,
    run: Mutex<Option<Run>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn EventSource>,
        transformer: Transformer,
        dispatcher: Dispatcher,
        liveness: HealthRegistry,
    ) -> Self {
        Self {
            config,
            source: Arc::new(Mutex::new(source)),
            shared: Arc::new(Shared {
                validator: EventValidator::new(),
                transformer,
                dispatcher,
                stats: PipelineStats::new(),
                running: AtomicBool::new(false),
            }),
            liveness,
            run: Mutex::new(None),
        }
    }

    /// Build a pipeline from the process configuration. Fails on invalid configuration only.
    pub fn from_config(
        config: &Config,
        source: Box<dyn EventSource>,
        liveness: HealthRegistry,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let routing = Arc::new(RoutingTable::with_overrides(
            config.default_target_system,
            &config.routing_overrides,
        ));
        let dispatcher = Dispatcher::new(
            config.endpoint_base_url.as_str(),
            config.request_timeout.0,
            config.retry_policy(),
            config.enable_dispatch,
        )?;

        Ok(Self::new(
            PipelineConfig::from(config),
            source,
            Transformer::new(routing),
            dispatcher,
            liveness,
        ))
    }

    /// The routing table used by the transformer stage. Updates apply to records transformed
    /// after the update, records already queued for dispatch keep their target.
    pub fn routing(&self) -> &Arc<RoutingTable> {
        self.shared.transformer.routing()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.shared.snapshot()
    }

    /// Zero all counters, validator counts included.
    pub fn reset_stats(&self) {
        self.shared.stats.reset();
        self.shared.validator.reset();
    }

    /// Spawn the stage tasks and return. Calling `start` on a running pipeline does nothing.
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.config.validate()?;

        let mut run = self.run.lock().await;
        if run.is_some() {
            warn!("pipeline is already running, ignoring start");
            return Ok(());
        }

        let source = self
            .source
            .clone()
            .try_lock_owned()
            .map_err(|_| PipelineError::SourceBusy)?;

        let stats = &self.shared.stats;
        let (raw_tx, raw_rx) =
            queue::bounded("raw", self.config.queue_capacity, stats.raw_depth.clone());
        let (validated_tx, validated_rx) = queue::bounded(
            "validated",
            self.config.queue_capacity,
            stats.validated_depth.clone(),
        );
        let (transformed_tx, transformed_rx) = queue::bounded(
            "transformed",
            self.config.queue_capacity,
            stats.transformed_depth.clone(),
        );

        let shutdown = CancellationToken::new();
        let feeder = Feeder {
            source,
            raw: raw_tx,
            batch_size: self.config.batch_size,
            batch_interval: self.config.batch_interval(),
        };

        let workers = vec![
            (
                "feeder",
                tokio::spawn(feeder.run(self.stage_context("feeder", &shutdown).await)),
            ),
            (
                "validator",
                tokio::spawn(validate_events(
                    self.stage_context("validator", &shutdown).await,
                    raw_rx,
                    validated_tx,
                )),
            ),
            (
                "transformer",
                tokio::spawn(transform_events(
                    self.stage_context("transformer", &shutdown).await,
                    validated_rx,
                    transformed_tx,
                )),
            ),
            (
                "dispatcher",
                tokio::spawn(dispatch_records(
                    self.stage_context("dispatcher", &shutdown).await,
                    transformed_rx,
                )),
            ),
            (
                "stats",
                tokio::spawn(log_stats(
                    self.shared.clone(),
                    self.config.stats_log_interval,
                    shutdown.clone(),
                )),
            ),
        ];

        stats.mark_started();
        self.shared.running.store(true, Ordering::Relaxed);
        info!(
            "pipeline started: {} events per second in batches of {}",
            self.config.events_per_second, self.config.batch_size
        );

        *run = Some(Run { shutdown, workers });
        Ok(())
    }

    /// Stop ingesting and let queued items drain. Stages still busy after the drain timeout are
    /// aborted. Calling `stop` on a stopped pipeline does nothing.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(Run { shutdown, workers }) = run.take() else {
            debug!("pipeline is not running, ignoring stop");
            return;
        };

        info!("stopping pipeline");
        shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        for (stage, mut handle) in workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} stage failed: {}", stage, e),
                Err(_) => {
                    warn!("{} stage did not drain in time, aborting it", stage);
                    handle.abort();
                    if let Err(e) = handle.await {
                        if !e.is_cancelled() {
                            error!("{} stage failed: {}", stage, e);
                        }
                    }
                }
            }
        }

        self.shared.stats.reset_queue_depths();
        self.shared.running.store(false, Ordering::Relaxed);
        info!("pipeline stopped");
    }

    async fn stage_context(&self, stage: &'static str, shutdown: &CancellationToken) -> Stage {
        let liveness = self
            .liveness
            .register(format!("pipeline-{stage}"), self.config.liveness_deadline)
            .await;

        Stage {
            name: stage,
            shared: self.shared.clone(),
            shutdown: shutdown.clone(),
            liveness,
            dequeue_timeout: self.config.dequeue_timeout,
        }
    }
}

/// What every stage task carries.
struct Stage {
    name: &'static str,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    liveness: HealthHandle,
    dequeue_timeout: time::Duration,
}

impl Stage {
    /// Wait for the next item, heartbeating on every dequeue timeout. `None` once the queue is
    /// closed, or empty after shutdown.
    async fn next_item<T>(&self, queue: &mut StageReceiver<T>) -> Option<T> {
        loop {
            self.liveness.report_healthy().await;
            match queue.recv_timeout(self.dequeue_timeout).await {
                Received::Item(item) => return Some(item),
                Received::Timeout if self.shutdown.is_cancelled() => return None,
                Received::Timeout => continue,
                Received::Closed => return None,
            }
        }
    }

    /// Hand an item to the next stage. Returns false if the next stage is gone.
    async fn forward<T>(&self, queue: &StageSender<T>, item: T) -> bool {
        match self.heartbeating(queue.send(item)).await {
            Ok(()) => true,
            Err(_) => {
                warn!("{} stage: downstream queue is closed, dropping item", self.name);
                false
            }
        }
    }

    /// Await `work`, heartbeating while it runs so a slow but progressing stage is not
    /// reported as stalled.
    async fn heartbeating<F: Future>(&self, work: F) -> F::Output {
        tokio::pin!(work);
        let period = self.dequeue_timeout;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return output,
                _ = heartbeat.tick() => self.liveness.report_healthy().await,
            }
        }
    }

    /// Run the work for one item. A panic is logged and counted, and `None` is returned so the
    /// stage loop can carry on with the next item.
    async fn guarded<F: Future>(&self, work: F) -> Option<F::Output> {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(output) => Some(output),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                error!("{} stage panicked, skipping item: {}", self.name, message);

                self.shared.stats.stage_panics.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("contact_stage_panics_total", &[("stage", self.name)])
                    .increment(1);
                None
            }
        }
    }
}

struct Feeder {
    source: OwnedMutexGuard<Box<dyn EventSource>>,
    raw: StageSender<Value>,
    batch_size: usize,
    batch_interval: time::Duration,
}

impl Feeder {
    /// Pull a batch from the source every `batch_interval` until shutdown or until the source is
    /// exhausted.
    async fn run(mut self, stage: Stage) {
        let mut interval = tokio::time::interval(self.batch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'feed: loop {
            tokio::select! {
                biased;
                _ = stage.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            stage.liveness.report_healthy().await;

            let batch = tokio::select! {
                biased;
                _ = stage.shutdown.cancelled() => break,
                batch = self.source.next_batch(self.batch_size) => batch,
            };
            let Some(batch) = batch else {
                info!("event source is exhausted");
                break;
            };

            for event in batch {
                let sent = tokio::select! {
                    biased;
                    _ = stage.shutdown.cancelled() => break 'feed,
                    sent = stage.forward(&self.raw, event) => sent,
                };
                if !sent {
                    break 'feed;
                }

                stage.shared.stats.generated.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("contact_events_generated_total").increment(1);
            }
        }

        debug!("feeder stage exiting");
        stage.liveness.report_stopped().await;
    }
}

async fn validate_events(
    stage: Stage,
    mut raw: StageReceiver<Value>,
    validated: StageSender<ChangeEvent>,
) {
    while let Some(event) = stage.next_item(&mut raw).await {
        let verdict = stage
            .guarded(async { stage.shared.validator.validate(&event) })
            .await;
        stage.shared.stats.processed.fetch_add(1, Ordering::Relaxed);

        if let Some(Verdict::Accepted(event)) = verdict {
            if !stage.forward(&validated, event).await {
                break;
            }
        }
    }

    debug!("validator stage exiting");
    stage.liveness.report_stopped().await;
}

async fn transform_events(
    stage: Stage,
    mut validated: StageReceiver<ChangeEvent>,
    transformed: StageSender<TransformedRecord>,
) {
    let stats = &stage.shared.stats;

    while let Some(event) = stage.next_item(&mut validated).await {
        let result = stage
            .guarded(async {
                stage
                    .shared
                    .transformer
                    .transform_event(event.operation, &event.payload)
            })
            .await;

        match result {
            Some(Ok(record)) => {
                stats.transformed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    "contact_events_transformed_total",
                    &[("target_system", record.target_system().as_str())]
                )
                .increment(1);

                if !stage.forward(&transformed, record).await {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("failed to transform contact {}: {}", event.payload.id, e);
                stats.transform_failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("contact_events_transform_failed_total").increment(1);
            }
            None => {}
        }
    }

    debug!("transformer stage exiting");
    stage.liveness.report_stopped().await;
}

async fn dispatch_records(stage: Stage, mut transformed: StageReceiver<TransformedRecord>) {
    while let Some(record) = stage.next_item(&mut transformed).await {
        let dispatch = stage.shared.dispatcher.dispatch(&record, &stage.shutdown);
        let outcome = stage.guarded(stage.heartbeating(dispatch)).await;

        if let Some(outcome) = outcome {
            stage.shared.stats.record_dispatch(&outcome);
        }
    }

    debug!("dispatcher stage exiting");
    stage.liveness.report_stopped().await;
}

/// Log a snapshot every `every` while the pipeline runs.
async fn log_stats(shared: Arc<Shared>, every: time::Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately, there is nothing to report yet.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match serde_json::to_string(&shared.snapshot()) {
            Ok(snapshot) => info!("pipeline stats: {}", snapshot),
            Err(e) => warn!("failed to serialize pipeline stats: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use contact_common::contact::ContactCategory;
    use contact_common::retry::RetryPolicy;
    use contact_common::routing::TargetSystem;
    use httpmock::prelude::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::ingest::VecSource;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            events_per_second: 1000.0,
            batch_size: 10,
            queue_capacity: 16,
            dequeue_timeout: time::Duration::from_millis(20),
            drain_timeout: time::Duration::from_secs(2),
            stats_log_interval: time::Duration::from_millis(50),
            liveness_deadline: time::Duration::from_secs(5),
        }
    }

    fn test_pipeline(server: &MockServer, source: Box<dyn EventSource>) -> Pipeline {
        test_pipeline_with(test_config(), server, source)
    }

    fn test_pipeline_with(
        config: PipelineConfig,
        server: &MockServer,
        source: Box<dyn EventSource>,
    ) -> Pipeline {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(1))
            .max_retries(2)
            .provide();
        let dispatcher = Dispatcher::new(
            &server.base_url(),
            time::Duration::from_secs(1),
            retry_policy,
            true,
        )
        .unwrap();

        Pipeline::new(
            config,
            source,
            Transformer::new(Arc::new(RoutingTable::default())),
            dispatcher,
            HealthRegistry::new("liveness"),
        )
    }

    fn event(id: &str, category: &str, email: &str) -> Value {
        json!({
            "record_kind": "contacts",
            "operation": "create",
            "timestamp": "2024-01-15T10:30:00Z",
            "payload": {
                "id": id,
                "name": "Ada Lovelace",
                "email": email,
                "phone": "+1-555-123-4567",
                "category": category,
                "created_at": "2024-01-15T10:30:00Z",
                "updated_at": "2024-01-15T10:30:00Z",
            }
        })
    }

    async fn wait_for<F>(pipeline: &Pipeline, check: F) -> PipelineSnapshot
    where
        F: Fn(&PipelineSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
        loop {
            let snapshot = pipeline.snapshot();
            if check(&snapshot) {
                return snapshot;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met, last snapshot: {snapshot:?}");
            }
            tokio::time::sleep(time::Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_batch_interval() {
        let config = PipelineConfig {
            events_per_second: 5.0,
            batch_size: 10,
            ..PipelineConfig::default()
        };
        assert_eq!(config.batch_interval(), time::Duration::from_secs(2));

        let config = PipelineConfig {
            events_per_second: 100.0,
            batch_size: 1,
            ..PipelineConfig::default()
        };
        assert_eq!(config.batch_interval(), time::Duration::from_millis(10));

        let config = PipelineConfig {
            events_per_second: 1e12,
            batch_size: 1,
            ..PipelineConfig::default()
        };
        assert_eq!(config.batch_interval(), time::Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_settings() {
        let server = MockServer::start();
        let invalid = [
            PipelineConfig {
                queue_capacity: 0,
                ..test_config()
            },
            PipelineConfig {
                batch_size: 0,
                ..test_config()
            },
            PipelineConfig {
                events_per_second: 0.0,
                ..test_config()
            },
            PipelineConfig {
                events_per_second: f64::NAN,
                ..test_config()
            },
            PipelineConfig {
                dequeue_timeout: time::Duration::ZERO,
                ..test_config()
            },
            PipelineConfig {
                stats_log_interval: time::Duration::ZERO,
                ..test_config()
            },
        ];

        for config in invalid {
            let pipeline = test_pipeline_with(
                config.clone(),
                &server,
                Box::new(VecSource::new(vec![json!({})])),
            );

            assert!(
                matches!(pipeline.start().await, Err(PipelineError::Config(_))),
                "started with {config:?}"
            );
            assert!(!pipeline.is_running());
            assert!(pipeline.snapshot().started_at.is_none());
            pipeline.stop().await;
        }
    }

    #[tokio::test]
    async fn test_counts_every_kind_of_event() {
        let server = MockServer::start();
        let hubspot = server.mock(|when, then| {
            when.method(POST).path("/hubspot/contact");
            then.status(200).json_body(json!({"id": "hs-1"}));
        });
        let salesforce = server.mock(|when, then| {
            when.method(POST).path("/salesforce/contact");
            then.status(400).body("bad request");
        });

        let events = vec![
            event("C000001", "customer", "ada@example.com"),
            event("C000002", "lead", "grace@example.com"),
            // Passes the validator, fails the email check in the transformer
            event("C000003", "customer", "not-an-email"),
            json!({"record_kind": "deals", "operation": "create"}),
            json!({"record_kind": "contacts", "operation": "merge", "payload": {}}),
        ];
        let pipeline = test_pipeline(&server, Box::new(VecSource::new(events)));

        pipeline.start().await.unwrap();
        let snapshot = wait_for(&pipeline, |s| s.dispatched + s.failed == 2).await;
        pipeline.stop().await;

        assert_eq!(snapshot.generated, 5);
        assert_eq!(snapshot.processed, 5);
        assert_eq!(snapshot.accepted, 3);
        assert_eq!(snapshot.ignored, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.transformed, 2);
        assert_eq!(snapshot.transform_failed, 1);
        assert_eq!(snapshot.dispatched, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.by_target_system["hubspot"].dispatched, 1);
        assert_eq!(snapshot.by_target_system["salesforce"].failed, 1);
        assert_eq!(snapshot.by_category["customer"], 2);
        hubspot.assert();
        salesforce.assert();
    }

    #[tokio::test]
    async fn test_start_twice_is_a_noop() {
        let server = MockServer::start();
        let pipeline = test_pipeline(&server, Box::new(VecSource::default()));

        pipeline.start().await.unwrap();
        let started_at = pipeline.snapshot().started_at;
        pipeline.start().await.unwrap();

        assert!(pipeline.is_running());
        assert_eq!(pipeline.snapshot().started_at, started_at);

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        // Stopping a stopped pipeline is fine too
        pipeline.stop().await;
    }

    /// Never runs dry, so only shutdown ends the feeder.
    struct EndlessSource;

    #[async_trait]
    impl EventSource for EndlessSource {
        async fn next_batch(&mut self, max: usize) -> Option<Vec<Value>> {
            Some(
                (0..max)
                    .map(|_| json!({"record_kind": "notes", "operation": "create"}))
                    .collect(),
            )
        }
    }

    #[tokio::test]
    async fn test_stop_drains_and_restart_resumes() {
        let server = MockServer::start();
        let pipeline = test_pipeline(&server, Box::new(EndlessSource));

        pipeline.start().await.unwrap();
        wait_for(&pipeline, |s| s.ignored >= 20).await;
        pipeline.stop().await;

        let stopped = pipeline.snapshot();
        assert!(!stopped.running);
        assert_eq!(stopped.generated, stopped.processed);
        assert_eq!(stopped.queue_depths.raw, 0);

        // Counters are cumulative across runs
        pipeline.start().await.unwrap();
        wait_for(&pipeline, |s| s.processed > stopped.processed).await;
        pipeline.stop().await;

        pipeline.reset_stats();
        let reset = pipeline.snapshot();
        assert_eq!(reset.generated, 0);
        assert_eq!(reset.ignored, 0);
    }

    /// Yields whatever was pushed since the previous batch, ends once the sender is dropped.
    struct ChannelSource(mpsc::UnboundedReceiver<Value>);

    #[async_trait]
    impl EventSource for ChannelSource {
        async fn next_batch(&mut self, max: usize) -> Option<Vec<Value>> {
            let mut batch = Vec::new();
            while batch.len() < max {
                match self.0.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) if batch.is_empty() => {
                        return None
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
            Some(batch)
        }
    }

    #[tokio::test]
    async fn test_routing_update_applies_to_later_events() {
        let server = MockServer::start();
        let hubspot = server.mock(|when, then| {
            when.method(POST).path("/hubspot/contact");
            then.status(200).json_body(json!({}));
        });
        let salesforce = server.mock(|when, then| {
            when.method(POST).path("/salesforce/contact");
            then.status(200).json_body(json!({}));
        });

        let (events, receiver) = mpsc::unbounded_channel();
        let pipeline = test_pipeline(&server, Box::new(ChannelSource(receiver)));
        pipeline.start().await.unwrap();

        events
            .send(event("C000001", "customer", "ada@example.com"))
            .unwrap();
        wait_for(&pipeline, |s| s.dispatched == 1).await;

        pipeline.routing().update(HashMap::from([(
            ContactCategory::Customer,
            TargetSystem::Salesforce,
        )]));
        events
            .send(event("C000002", "customer", "grace@example.com"))
            .unwrap();
        let snapshot = wait_for(&pipeline, |s| s.dispatched == 2).await;
        pipeline.stop().await;

        assert_eq!(snapshot.routing["customer"], "salesforce");
        assert_eq!(snapshot.by_target_system["hubspot"].dispatched, 1);
        assert_eq!(snapshot.by_target_system["salesforce"].dispatched, 1);
        hubspot.assert_hits(1);
        salesforce.assert_hits(1);
    }

    #[tokio::test]
    async fn test_stop_clears_depths_of_aborted_stages() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(200).delay(time::Duration::from_secs(5));
        });

        let config = PipelineConfig {
            drain_timeout: time::Duration::from_millis(100),
            ..test_config()
        };
        let events = (1..=5)
            .map(|i| event(&format!("C00000{i}"), "customer", "ada@example.com"))
            .collect();
        let pipeline = test_pipeline_with(config, &server, Box::new(VecSource::new(events)));

        pipeline.start().await.unwrap();
        // One record is stuck in flight, the rest wait in the dispatcher's queue
        wait_for(&pipeline, |s| s.transformed == 5 && s.queue_depths.transformed >= 1).await;
        pipeline.stop().await;

        let stopped = pipeline.snapshot();
        assert!(!stopped.running);
        assert_eq!(stopped.dispatched, 0);
        assert_eq!(stopped.queue_depths.raw, 0);
        assert_eq!(stopped.queue_depths.validated, 0);
        assert_eq!(stopped.queue_depths.transformed, 0);
    }

    #[tokio::test]
    async fn test_panic_in_item_work_is_contained() {
        let server = MockServer::start();
        let pipeline = test_pipeline(&server, Box::new(VecSource::default()));
        let stage = pipeline
            .stage_context("validator", &CancellationToken::new())
            .await;

        let output: Option<()> = stage.guarded(async { panic!("bad item") }).await;
        let next: Option<u32> = stage.guarded(async { 7 }).await;

        assert!(output.is_none());
        assert_eq!(next, Some(7));
        assert_eq!(pipeline.snapshot().stage_panics, 1);
    }
}
