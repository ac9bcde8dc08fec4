use std::time;

use enrich_common::cache::CacheError;
use http::StatusCode;
use thiserror::Error;

/// Invalid settings, rejected before the stage is built.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("on-fail policy should be one of: abort, ignore, retry (got {0:?})")]
    InvalidOnFailPolicy(String),
    #[error("unknown enrichment service {0:?}, expected openalex or hal")]
    InvalidService(String),
    #[error("unknown cache backend {0:?}, expected redis or memory")]
    InvalidCacheBackend(String),
    #[error("invalid field mapping table: {0}")]
    InvalidMapping(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Errors preventing the stage from starting.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to ensure indexes, cache not available for {service}: {error}")]
    CacheUnavailable {
        service: String,
        #[source]
        error: CacheError,
    },
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("invalid service url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failure of a single round trip to the external service.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("authentication error (is the token valid?): {0}")]
    Authentication(String),
    #[error("rate limited by the service")]
    RateLimited { reset_after: Option<time::Duration> },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("request failed with status {0}")]
    Status(StatusCode),
    #[error("got invalid response from the service: {0}")]
    MalformedResponse(String),
}

impl QueryError {
    /// Authentication failures cannot be fixed by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueryError::Authentication(_))
    }
}

/// Errors that stop the whole stage and are surfaced to the job controller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{service}: {message}")]
    Authentication { service: String, message: String },
    #[error("failed to query {service} {attempts} times in a row")]
    RetriesExhausted { service: String, attempts: u32 },
    #[error("failed to query {service} for {elapsed:?} ({attempts} attempts), giving up")]
    RetryCeilingExceeded {
        service: String,
        attempts: u32,
        elapsed: time::Duration,
    },
}
