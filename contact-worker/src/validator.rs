//! # Validator
//!
//! First stage after ingestion. Turns loosely typed JSON events into `ChangeEvent`s, counts
//! what it sees, and decides whether an event moves on.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use contact_common::contact::ContactCategory;
use contact_common::event::{
    ChangeEvent, Operation, CONTACTS_RECORD_KIND, MANDATORY_PAYLOAD_FIELDS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StructuralError;

/// Outcome of validating one event.
#[derive(Debug)]
pub enum Verdict {
    /// A well formed contact event, to be forwarded.
    Accepted(ChangeEvent),
    /// A well formed event of another record kind. Acknowledged and dropped.
    Ignored,
    /// Not forwarded, the stream goes on.
    Rejected(StructuralError),
}

impl Verdict {
    /// Whether the event was handled without error, i.e. accepted or ignored.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Verdict::Rejected(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted(_) => "accepted",
            Verdict::Ignored => "ignored",
            Verdict::Rejected(_) => "rejected",
        }
    }
}

#[derive(Default)]
pub struct EventValidator {
    accepted: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
    by_operation: [AtomicU64; Operation::ALL.len()],
    by_category: [AtomicU64; ContactCategory::ALL.len()],
}

/// Point in time copy of the validator counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidatorCounts {
    pub accepted: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub by_operation: BTreeMap<&'static str, u64>,
    pub by_category: BTreeMap<&'static str, u64>,
}

impl EventValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boolean form of `validate`: true for accepted and ignored events.
    pub fn accept(&self, event: &Value) -> bool {
        self.validate(event).is_ok()
    }

    pub fn validate(&self, event: &Value) -> Verdict {
        let verdict = match parse_event(event) {
            Ok(Some(event)) => {
                self.by_operation[event.operation.index()].fetch_add(1, Ordering::Relaxed);
                self.by_category[event.payload.category.index()].fetch_add(1, Ordering::Relaxed);
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Verdict::Accepted(event)
            }
            Ok(None) => {
                debug!("ignoring event of record kind {:?}", event.get("record_kind"));
                self.ignored.fetch_add(1, Ordering::Relaxed);
                Verdict::Ignored
            }
            Err(error) => {
                warn!("rejecting event: {}", error);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Verdict::Rejected(error)
            }
        };

        metrics::counter!("contact_events_validated_total", &[("verdict", verdict.label())])
            .increment(1);
        verdict
    }

    pub fn counts(&self) -> ValidatorCounts {
        ValidatorCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            by_operation: Operation::ALL
                .iter()
                .map(|op| (op.as_str(), self.by_operation[op.index()].load(Ordering::Relaxed)))
                .collect(),
            by_category: ContactCategory::ALL
                .iter()
                .map(|c| (c.as_str(), self.by_category[c.index()].load(Ordering::Relaxed)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        for counter in [&self.accepted, &self.ignored, &self.rejected]
            .into_iter()
            .chain(self.by_operation.iter())
            .chain(self.by_category.iter())
        {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// `Ok(None)` for events of another record kind. Those are not inspected any further.
fn parse_event(event: &Value) -> Result<Option<ChangeEvent>, StructuralError> {
    let object = event.as_object().ok_or(StructuralError::NotAnObject)?;

    let record_kind = object
        .get("record_kind")
        .and_then(Value::as_str)
        .ok_or(StructuralError::MissingRecordKind)?;
    if record_kind != CONTACTS_RECORD_KIND {
        return Ok(None);
    }

    let operation = object
        .get("operation")
        .and_then(Value::as_str)
        .ok_or(StructuralError::MissingOperation)?;
    operation
        .parse::<Operation>()
        .map_err(|_| StructuralError::InvalidOperation(operation.to_owned()))?;

    let payload = object
        .get("payload")
        .and_then(Value::as_object)
        .ok_or(StructuralError::MissingPayload)?;
    for field in MANDATORY_PAYLOAD_FIELDS {
        if payload.get(field).map_or(true, Value::is_null) {
            return Err(StructuralError::MissingField(field));
        }
    }

    Ok(Some(ChangeEvent::deserialize(event)?))
}
