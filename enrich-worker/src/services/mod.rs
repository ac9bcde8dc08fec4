//! HTTP clients for the services records can be enriched from.

use std::time;

use http::StatusCode;
use reqwest::header;

use crate::error::{QueryError, SetupError};

pub mod hal;
pub mod openalex;

pub use hal::HalClient;
pub use openalex::OpenAlexClient;

const USER_AGENT: &str = "enrich-worker";

/// Build the JSON client shared by the service instances.
pub(crate) fn http_client(request_timeout: time::Duration) -> Result<reqwest::Client, SetupError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(USER_AGENT)
        .timeout(request_timeout)
        .build()?;

    Ok(client)
}

/// Map a non-success response to the matching `QueryError`.
pub(crate) fn check_status(response: reqwest::Response) -> Result<reqwest::Response, QueryError> {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(QueryError::Authentication(
            format!("request failed with status {status}"),
        )),
        StatusCode::TOO_MANY_REQUESTS => Err(QueryError::RateLimited {
            reset_after: parse_rate_limit_reset(response.headers()),
        }),
        status if !status.is_success() => Err(QueryError::Status(status)),
        _ => Ok(response),
    }
}

/// Attempt to parse when the rate limit resets, from a `Retry-After` header
/// (seconds or HTTP date) or an `X-RateLimit-Reset` header (seconds, unix
/// timestamp or RFC 3339 date).
pub(crate) fn parse_rate_limit_reset(header_map: &header::HeaderMap) -> Option<time::Duration> {
    if let Some(retry_after) = header_value(header_map, header::RETRY_AFTER.as_str()) {
        if let Ok(u) = retry_after.parse::<u64>() {
            return Some(time::Duration::from_secs(u));
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
            let duration =
                chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

            // This can only fail when negative, in which case we return None.
            return duration.to_std().ok();
        }
    }

    let reset = header_value(header_map, "x-ratelimit-reset")?;

    if let Ok(u) = reset.parse::<i64>() {
        // Large values are absolute timestamps, small ones a number of seconds.
        if u > 1_000_000_000 {
            let now = chrono::offset::Utc::now().timestamp();
            return u64::try_from(u - now).ok().map(time::Duration::from_secs);
        }
        return u64::try_from(u).ok().map(time::Duration::from_secs);
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(reset) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();
        return duration.to_std().ok();
    }

    None
}

fn header_value<'a>(header_map: &'a header::HeaderMap, name: &str) -> Option<&'a str> {
    header_map.get(name)?.to_str().ok()
}
