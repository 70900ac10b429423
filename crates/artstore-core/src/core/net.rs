//! Shared HTTP client construction and the transfer retry loop.

use std::env;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{Jitter, RetryDecision, RetryPolicy};
use tracing::{debug, warn};

use artstore_domain::ArtifactError;

use crate::core::config::TransferSettings;

pub(crate) const USER_AGENT: &str = concat!("artstore/", env!("CARGO_PKG_VERSION"));

/// Statuses that are retried with backoff; anything else unsuccessful is fatal.
pub(crate) const RETRYABLE_STATUSES: [u16; 8] = [308, 408, 409, 429, 500, 502, 503, 504];

const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Decide whether the store should honor standard proxy environment variables.
///
/// - `ARTSTORE_KEEP_PROXIES=1/true/yes/on` forces proxies on.
/// - `ARTSTORE_KEEP_PROXIES=0/false/no/off/""` forces proxies off.
/// - If unset, proxies are enabled only when at least one proxy env var is set.
pub(crate) fn keep_proxies() -> bool {
    match env::var("ARTSTORE_KEEP_PROXIES") {
        Ok(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            !matches!(value.as_str(), "" | "0" | "false" | "no" | "off")
        }
        Err(_) => {
            const PROXY_KEYS: &[&str] = &[
                "HTTP_PROXY",
                "http_proxy",
                "HTTPS_PROXY",
                "https_proxy",
                "ALL_PROXY",
                "all_proxy",
            ];
            PROXY_KEYS.iter().any(|key| {
                env::var(key)
                    .ok()
                    .is_some_and(|value| !value.trim().is_empty())
            })
        }
    }
}

/// Blocking client with a bounded idle pool, shared by uploads and downloads.
pub(crate) fn http_client(settings: &TransferSettings) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(settings.timeout)
        .pool_max_idle_per_host(settings.pool_size);
    if !keep_proxies() {
        builder = builder.no_proxy();
    }
    builder.build().context("failed to build HTTP client")
}

pub(crate) fn is_retryable(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Backoff for `settings`: `backoff_base` doubling up to two minutes, with
/// `max_attempts - 1` retries after the first try.
pub(crate) fn retry_policy(settings: &TransferSettings) -> ExponentialBackoff {
    let retries = u32::try_from(settings.max_attempts.max(1) - 1).unwrap_or(u32::MAX);
    ExponentialBackoff::builder()
        .retry_bounds(settings.backoff_base.min(MAX_BACKOFF), MAX_BACKOFF)
        .jitter(Jitter::Bounded)
        .build_with_max_retries(retries)
}

/// Run `send` until it yields a successful response.
///
/// Transport errors and [`RETRYABLE_STATUSES`] are retried while the
/// [`retry_policy`] allows; other failing statuses surface immediately as
/// [`ArtifactError::UploadFailed`].
pub(crate) fn send_with_retry<F>(settings: &TransferSettings, url: &str, mut send: F) -> Result<Response>
where
    F: FnMut() -> Result<Response>,
{
    let policy = retry_policy(settings);
    let started = SystemTime::now();
    let mut attempts = 0_usize;
    loop {
        attempts += 1;
        let failure = match send() {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                if !is_retryable(status) {
                    return Err(ArtifactError::UploadFailed {
                        url: url.to_string(),
                        status,
                    }
                    .into());
                }
                format!("status {status}")
            }
            Err(err) => format!("{err:#}"),
        };
        let past_retries = u32::try_from(attempts - 1).unwrap_or(u32::MAX);
        match policy.should_retry(started, past_retries) {
            RetryDecision::Retry { execute_after } => {
                let delay = execute_after
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                debug!(%url, attempt = attempts, %failure, ?delay, "retrying transfer");
                thread::sleep(delay);
            }
            RetryDecision::DoNotRetry => {
                warn!(%url, attempts, %failure, "transfer retries exhausted");
                return Err(ArtifactError::BackendUnavailable {
                    url: url.to_string(),
                    attempts,
                    detail: failure,
                }
                .into());
            }
        }
    }
}
