//! # Dispatcher
//!
//! Delivers transformed records to the contact endpoint of their target system.
//!
//! A record is POSTed as JSON, without its dispatch metadata. A 200 response completes it.
//! A 429 response or a transport failure is retried after an exponentially growing, jittered
//! delay, until the retry policy gives up. Any other status fails the record immediately.
//! Backoff sleeps end early when the pipeline shuts down.
use std::time;

use contact_common::retry::RetryPolicy;
use contact_common::routing::TargetSystem;
use contact_common::transform::TransformedRecord;
use http::StatusCode;
use reqwest::header;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, PipelineError};

/// Why a dispatch did not succeed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailure {
    /// Every attempt allowed by the retry policy failed with a retryable error.
    RetriesExhausted,
    /// The endpoint answered with a status that is not worth retrying.
    Rejected,
    /// Shutdown interrupted the backoff before the next attempt.
    Cancelled,
    /// The record could not be encoded. Nothing was sent.
    Serialization,
}

impl DispatchFailure {
    fn as_str(&self) -> &'static str {
        match self {
            DispatchFailure::RetriesExhausted => "retries_exhausted",
            DispatchFailure::Rejected => "rejected",
            DispatchFailure::Cancelled => "cancelled",
            DispatchFailure::Serialization => "serialization",
        }
    }
}

/// Result of delivering one record, including all of its retries.
#[derive(Clone, Debug, Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub target_system: TargetSystem,
    /// Status of the last response received, if any.
    pub http_status: Option<u16>,
    /// Parsed body of a successful response.
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub failure: Option<DispatchFailure>,
    /// Requests made, 0 when nothing was sent.
    pub attempts: u32,
    /// Backoff slept before each retry.
    #[serde(skip)]
    pub backoff: Vec<time::Duration>,
}

impl DispatchOutcome {
    fn new(target_system: TargetSystem) -> Self {
        Self {
            success: false,
            target_system,
            http_status: None,
            response: None,
            error: None,
            failure: None,
            attempts: 0,
            backoff: Vec::new(),
        }
    }

    fn failed(mut self, failure: DispatchFailure, error: &DispatchError) -> Self {
        self.failure = Some(failure);
        self.error = Some(error.to_string());
        self
    }

    fn label(&self) -> &'static str {
        match self.failure {
            None => "success",
            Some(failure) => failure.as_str(),
        }
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    endpoints: [reqwest::Url; TargetSystem::ALL.len()],
    retry_policy: RetryPolicy,
    enabled: bool,
}

impl Dispatcher {
    /// `enabled = false` turns the dispatcher into a dry run that logs records instead of sending them.
    pub fn new(
        endpoint_base_url: &str,
        request_timeout: time::Duration,
        retry_policy: RetryPolicy,
        enabled: bool,
    ) -> Result<Self, PipelineError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Contact Sync Worker")
            .timeout(request_timeout)
            .build()?;

        let endpoint = |target_system: TargetSystem| {
            endpoint_url(endpoint_base_url, target_system)
                .map_err(|error| PipelineError::InvalidEndpoint(target_system, error))
        };

        Ok(Self {
            client,
            endpoints: [
                endpoint(TargetSystem::Salesforce)?,
                endpoint(TargetSystem::Hubspot)?,
            ],
            retry_policy,
            enabled,
        })
    }

    pub fn endpoint(&self, target_system: TargetSystem) -> &reqwest::Url {
        &self.endpoints[target_system.index()]
    }

    /// Deliver a record, retrying as the retry policy allows. Never fails: every error ends up in
    /// the outcome. `shutdown` only interrupts backoff sleeps, a request in flight runs until its
    /// timeout.
    pub async fn dispatch(
        &self,
        record: &TransformedRecord,
        shutdown: &CancellationToken,
    ) -> DispatchOutcome {
        let target_system = record.target_system();
        let labels = [("target_system", target_system.as_str())];
        let start = tokio::time::Instant::now();

        let outcome = self.dispatch_with_retries(record, shutdown).await;

        metrics::counter!(
            "contact_dispatch_total",
            &[
                ("target_system", target_system.as_str()),
                ("outcome", outcome.label()),
            ]
        )
        .increment(1);
        metrics::histogram!("contact_dispatch_attempts", &labels).record(outcome.attempts as f64);
        metrics::histogram!("contact_dispatch_duration_seconds", &labels)
            .record(start.elapsed().as_secs_f64());

        outcome
    }

    async fn dispatch_with_retries(
        &self,
        record: &TransformedRecord,
        shutdown: &CancellationToken,
    ) -> DispatchOutcome {
        let target_system = record.target_system();
        let mut outcome = DispatchOutcome::new(target_system);

        let body = match serde_json::to_vec(&record.body) {
            Ok(body) => body,
            Err(e) => {
                let error = DispatchError::SerializationError(target_system, e);
                warn!("{}", error);
                return outcome.failed(DispatchFailure::Serialization, &error);
            }
        };

        if !self.enabled {
            info!(
                "dry run, not sending {} to {}: {}",
                record.metadata.source_id,
                target_system,
                String::from_utf8_lossy(&body)
            );
            outcome.success = true;
            return outcome;
        }

        loop {
            outcome.attempts += 1;

            match self.send_record(target_system, body.clone()).await {
                Ok((status, response)) => {
                    debug!(
                        "delivered {} to {} after {} attempt(s)",
                        record.metadata.source_id, target_system, outcome.attempts
                    );
                    outcome.success = true;
                    outcome.http_status = Some(status.as_u16());
                    outcome.response = response;
                    return outcome;
                }
                Err(error) if error.is_retryable() => {
                    outcome.http_status = error.status();

                    if !self.retry_policy.should_retry(outcome.attempts) {
                        warn!(
                            "giving up on {} for {} after {} attempts: {}",
                            record.metadata.source_id, target_system, outcome.attempts, error
                        );
                        return outcome.failed(DispatchFailure::RetriesExhausted, &error);
                    }

                    let delay = self.retry_policy.jittered_retry_interval(
                        outcome.attempts,
                        error.retry_after(),
                        &mut rand::thread_rng(),
                    );
                    debug!(
                        "retrying {} for {} in {:?}: {}",
                        record.metadata.source_id, target_system, delay, error
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            info!("shutdown during backoff, dropping {}", record.metadata.source_id);
                            return outcome.failed(DispatchFailure::Cancelled, &error);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    outcome.backoff.push(delay);
                }
                Err(error) => {
                    warn!(
                        "{} rejected {}: {}",
                        target_system, record.metadata.source_id, error
                    );
                    outcome.http_status = error.status();
                    return outcome.failed(DispatchFailure::Rejected, &error);
                }
            }
        }
    }

    /// Make one request to the contact endpoint of a target system. A 200 is a delivery even if
    /// its body cannot be read, retrying it would post the record twice.
    async fn send_record(
        &self,
        target_system: TargetSystem,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Option<serde_json::Value>), DispatchError> {
        let response = self
            .client
            .post(self.endpoint(target_system).clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::OK {
            let body = match response.text().await {
                Ok(text) => {
                    Some(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
                }
                Err(e) => {
                    warn!(
                        "{} accepted a record but its response body was lost: {}",
                        target_system, e
                    );
                    None
                }
            };
            Ok((status, body))
        } else if is_retryable_status(status) {
            Err(DispatchError::RateLimited {
                retry_after: parse_retry_after_header(response.headers()),
            })
        } else {
            Err(DispatchError::NonRetryableRequestError {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

/// `{base}/{target_system}/contact`
fn endpoint_url(
    endpoint_base_url: &str,
    target_system: TargetSystem,
) -> Result<reqwest::Url, url::ParseError> {
    reqwest::Url::parse(&format!(
        "{}/{}/contact",
        endpoint_base_url.trim_end_matches('/'),
        target_system
    ))
}

/// Only rate limiting is worth retrying, other errors are passed through to the caller.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &reqwest::header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
