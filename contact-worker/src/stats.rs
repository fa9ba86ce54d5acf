use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use contact_common::contact::ContactCategory;
use contact_common::routing::TargetSystem;
use serde::Serialize;

use crate::dispatcher::{DispatchFailure, DispatchOutcome};
use crate::queue::QueueDepth;
use crate::validator::ValidatorCounts;

/// Process wide pipeline counters. Each counter is written by a single stage and read by anyone.
#[derive(Default)]
pub struct PipelineStats {
    // Feeder
    pub(crate) generated: AtomicU64,
    // Validator
    pub(crate) processed: AtomicU64,
    // Transformer
    pub(crate) transformed: AtomicU64,
    pub(crate) transform_failed: AtomicU64,
    // Dispatcher
    pub(crate) dispatched: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) dispatched_by_target: [AtomicU64; TargetSystem::ALL.len()],
    pub(crate) failed_by_target: [AtomicU64; TargetSystem::ALL.len()],
    // Any stage
    pub(crate) stage_panics: AtomicU64,

    pub(crate) raw_depth: QueueDepth,
    pub(crate) validated_depth: QueueDepth,
    pub(crate) transformed_depth: QueueDepth,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mark_started(&self) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_dispatch(&self, outcome: &DispatchOutcome) {
        let target = outcome.target_system.index();
        self.retries
            .fetch_add(u64::from(outcome.attempts.saturating_sub(1)), Ordering::Relaxed);

        match (outcome.success, outcome.failure) {
            (true, _) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                self.dispatched_by_target[target].fetch_add(1, Ordering::Relaxed);
            }
            (false, Some(DispatchFailure::Cancelled)) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            (false, _) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.failed_by_target[target].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Zero the queue depths once no stage holds a queue anymore. An aborted stage never
    /// decrements the depth for the items it was still holding.
    pub(crate) fn reset_queue_depths(&self) {
        self.raw_depth.reset();
        self.validated_depth.reset();
        self.transformed_depth.reset();
    }

    /// Zero every counter. The start time and queue depths describe the current run and are kept.
    pub fn reset(&self) {
        for counter in [
            &self.generated,
            &self.processed,
            &self.transformed,
            &self.transform_failed,
            &self.dispatched,
            &self.failed,
            &self.cancelled,
            &self.retries,
            &self.stage_panics,
        ]
        .into_iter()
        .chain(self.dispatched_by_target.iter())
        .chain(self.failed_by_target.iter())
        {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(
        &self,
        running: bool,
        validator: ValidatorCounts,
        routing: BTreeMap<ContactCategory, TargetSystem>,
    ) -> PipelineSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let started_at = self.started_at();

        PipelineSnapshot {
            running,
            started_at,
            uptime_seconds: started_at
                .filter(|_| running)
                .map(|started_at| (Utc::now() - started_at).num_seconds()),
            generated: load(&self.generated),
            processed: load(&self.processed),
            accepted: validator.accepted,
            ignored: validator.ignored,
            rejected: validator.rejected,
            transformed: load(&self.transformed),
            transform_failed: load(&self.transform_failed),
            dispatched: load(&self.dispatched),
            failed: load(&self.failed),
            cancelled: load(&self.cancelled),
            retries: load(&self.retries),
            stage_panics: load(&self.stage_panics),
            by_operation: validator.by_operation,
            by_category: validator.by_category,
            by_target_system: TargetSystem::ALL
                .iter()
                .map(|target| {
                    (
                        target.as_str(),
                        TargetCounts {
                            dispatched: load(&self.dispatched_by_target[target.index()]),
                            failed: load(&self.failed_by_target[target.index()]),
                        },
                    )
                })
                .collect(),
            queue_depths: QueueDepths {
                raw: self.raw_depth.get(),
                validated: self.validated_depth.get(),
                transformed: self.transformed_depth.get(),
            },
            routing: routing
                .into_iter()
                .map(|(category, target)| (category.as_str(), target.as_str()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TargetCounts {
    pub dispatched: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub raw: usize,
    pub validated: usize,
    pub transformed: usize,
}

/// Read-only view of the pipeline, served at `/stats` and logged periodically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<i64>,
    pub generated: u64,
    pub processed: u64,
    pub accepted: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub transformed: u64,
    pub transform_failed: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub stage_panics: u64,
    pub by_operation: BTreeMap<&'static str, u64>,
    pub by_category: BTreeMap<&'static str, u64>,
    pub by_target_system: BTreeMap<&'static str, TargetCounts>,
    pub queue_depths: QueueDepths,
    pub routing: BTreeMap<&'static str, &'static str>,
}
