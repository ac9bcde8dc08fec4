use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use enrich_common::retry::RetryPolicy;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{ConfigError, PipelineError, QueryError};
use crate::report::Report;
use crate::service::{Document, EnrichmentService};

/// What to do with a packet once `max_attempts` queries failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailPolicy {
    /// Stop the stage.
    Abort,
    /// Let the packet's records through unenriched.
    Ignore,
    /// Keep trying until the retry ceiling is reached.
    Retry,
}

impl FromStr for OnFailPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "abort" => Ok(OnFailPolicy::Abort),
            "ignore" => Ok(OnFailPolicy::Ignore),
            "retry" => Ok(OnFailPolicy::Retry),
            invalid => Err(ConfigError::InvalidOnFailPolicy(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    /// Minimum delay before any query.
    pub throttle: Duration,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    pub on_fail: OnFailPolicy,
    /// Under the retry policy, give up on a packet after this long.
    pub retry_ceiling: Duration,
    /// Added to the reset time the service announces when rate limiting.
    pub rate_limit_margin: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(200),
            max_attempts: 5,
            retry_policy: RetryPolicy::new(
                2,
                Duration::from_secs(1),
                Some(Duration::from_secs(60)),
            ),
            on_fail: OnFailPolicy::Abort,
            retry_ceiling: Duration::from_secs(600),
            rate_limit_margin: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Resolution {
    Resolved(Vec<Document>),
    /// Retries ran out and the packet should pass through unenriched.
    Skipped,
}

/// Resolves the keys of a packet with one batched query, retrying with an
/// exponential backoff. The throttle adapts to rate limits and reverts on the
/// next success.
pub struct BatchResolver {
    service: Arc<dyn EnrichmentService>,
    settings: ResolverSettings,
    throttle: Duration,
    report: Arc<Report>,
}

impl BatchResolver {
    pub fn new(
        service: Arc<dyn EnrichmentService>,
        settings: ResolverSettings,
        report: Arc<Report>,
    ) -> Self {
        Self {
            service,
            throttle: settings.throttle,
            settings,
            report,
        }
    }

    /// The delay currently applied before each query.
    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub async fn resolve(&mut self, keys: &[String]) -> Result<Resolution, PipelineError> {
        let rows = keys.len() * 2;
        let started = Instant::now();
        let mut tries: u32 = 0;

        loop {
            if tries >= self.settings.max_attempts {
                match self.settings.on_fail {
                    OnFailPolicy::Ignore => {
                        error!(
                            "{}: failed to query {} times in a row, ignoring packet of {} keys",
                            self.service.name(),
                            tries,
                            keys.len()
                        );
                        self.report.packet_ignored();
                        return Ok(Resolution::Skipped);
                    }
                    OnFailPolicy::Abort => {
                        return Err(PipelineError::RetriesExhausted {
                            service: self.service.name().to_owned(),
                            attempts: tries,
                        });
                    }
                    OnFailPolicy::Retry => {
                        let elapsed = started.elapsed();
                        if elapsed >= self.settings.retry_ceiling {
                            return Err(PipelineError::RetryCeilingExceeded {
                                service: self.service.name().to_owned(),
                                attempts: tries,
                                elapsed,
                            });
                        }
                    }
                }
            }

            let wait = match tries {
                0 => self.throttle,
                _ => self
                    .settings
                    .retry_policy
                    .time_until_next_retry(tries, Some(self.throttle)),
            };
            tokio::time::sleep(wait).await;

            self.report.query();
            let sent = Instant::now();
            let result = self.service.query(keys, rows).await;
            self.report.response_time(sent.elapsed());

            match result {
                Ok(documents) => {
                    self.restore_throttle();
                    return Ok(Resolution::Resolved(documents));
                }
                Err(QueryError::RateLimited { reset_after }) => {
                    self.report.query_failed();
                    self.adapt_throttle(reset_after);
                }
                Err(error) if error.is_fatal() => {
                    self.report.query_failed();
                    return Err(PipelineError::Authentication {
                        service: self.service.name().to_owned(),
                        message: error.to_string(),
                    });
                }
                Err(error) => {
                    self.report.query_failed();
                    warn!(
                        "{}: query failed (attempt {}): {error}",
                        self.service.name(),
                        tries + 1
                    );
                }
            }

            tries += 1;
        }
    }

    fn adapt_throttle(&mut self, reset_after: Option<Duration>) {
        let Some(reset_after) = reset_after else {
            warn!("{}: rate limited without a reset hint", self.service.name());
            return;
        };

        let throttle = reset_after + self.settings.rate_limit_margin;
        info!(
            "{}: rate limited, throttle changed from {:?} to {:?}",
            self.service.name(),
            self.throttle,
            throttle
        );
        self.throttle = throttle;
    }

    fn restore_throttle(&mut self) {
        if self.throttle != self.settings.throttle {
            info!(
                "{}: throttle restored to {:?}",
                self.service.name(),
                self.settings.throttle
            );
            self.throttle = self.settings.throttle;
        }
    }
}
