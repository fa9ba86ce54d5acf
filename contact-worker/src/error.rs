use std::time;

use contact_common::routing::TargetSystem;
use thiserror::Error;

/// Enumeration of reasons a raw event is rejected by the validator.
#[derive(Error, Debug)]
pub enum StructuralError {
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("event has no record_kind")]
    MissingRecordKind,
    #[error("event has no operation")]
    MissingOperation,
    #[error("{0} is not a valid operation")]
    InvalidOperation(String),
    #[error("event has no payload object")]
    MissingPayload,
    #[error("event payload is missing required field {0}")]
    MissingField(&'static str),
    #[error("event payload could not be parsed: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Enumeration of errors related to delivering a record to a target system.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to serialize {0} record")]
    SerializationError(TargetSystem, #[source] serde_json::Error),
    #[error("a record could not be delivered but it could be retried later: {0}")]
    TransportError(#[from] reqwest::Error),
    #[error("a record was rate limited and can be retried later")]
    RateLimited { retry_after: Option<time::Duration> },
    #[error("a record could not be delivered and it cannot be retried: {status} {body}")]
    NonRetryableRequestError { status: u16, body: String },
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::TransportError(_) | DispatchError::RateLimited { .. }
        )
    }

    /// Status of the response that caused the error, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchError::SerializationError(..) => None,
            DispatchError::TransportError(error) => error.status().map(|status| status.as_u16()),
            DispatchError::RateLimited { .. } => Some(429),
            DispatchError::NonRetryableRequestError { status, .. } => Some(*status),
        }
    }

    /// Delay the endpoint asked for before the next attempt.
    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            DispatchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Configuration problems found at startup. These are the only errors that stop the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration from env: {0}")]
    Load(#[from] envconfig::Error),
    #[error("events per second must be positive, got {0}")]
    NonPositiveRate(f64),
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("queue capacity must be positive")]
    ZeroQueueCapacity,
    #[error("{0} must be positive")]
    ZeroDuration(&'static str),
    #[error("endpoint base url is not valid: {0}")]
    InvalidEndpointBaseUrl(url::ParseError),
}

/// Enumeration of errors related to building and starting the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to construct http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("endpoint url for {0} is not valid")]
    InvalidEndpoint(TargetSystem, #[source] url::ParseError),
    #[error("the event source is still held by a previous run")]
    SourceBusy,
}
