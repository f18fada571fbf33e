//! One module per provider. Each client owns its authentication
//! handshake, its pagination protocol, and its refreshed-credential
//! cache; nothing about a provider leaks into the others.

pub mod folder;
pub mod garmin;
pub mod keep;
pub mod nike;
pub mod strava;

use crate::activity::ProviderKind;
use crate::error::SyncError;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RATE_LIMIT_ATTEMPTS: u32 = 3;
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(2);

/// A provider-native activity, before normalization.
#[derive(Debug, Clone)]
pub enum RawActivity {
    Strava(strava::StravaActivity),
    Garmin(garmin::GarminRaw),
    Nike(nike::NikeRaw),
    Keep(keep::KeepRaw),
    Folder(folder::FolderActivity),
}

impl RawActivity {
    pub fn provider(&self) -> ProviderKind {
        match self {
            RawActivity::Strava(_) => ProviderKind::Strava,
            RawActivity::Garmin(_) => ProviderKind::Garmin,
            RawActivity::Nike(_) => ProviderKind::Nike,
            RawActivity::Keep(_) => ProviderKind::Keep,
            RawActivity::Folder(_) => ProviderKind::Folder,
        }
    }

    pub fn native_id(&self) -> String {
        match self {
            RawActivity::Strava(a) => a.id.to_string(),
            RawActivity::Garmin(a) => a.summary.activity_id.to_string(),
            RawActivity::Nike(a) => a.summary.id.clone(),
            RawActivity::Keep(a) => a.summary.id.clone(),
            RawActivity::Folder(a) => a.native_id.clone(),
        }
    }
}

/// One page of raw activities plus the continuation state to commit
/// once the page has been merged.
#[derive(Debug)]
pub struct Page {
    pub raw: Vec<RawActivity>,
    /// Cursor to persist after this page commits, if it advanced.
    pub next_cursor: Option<String>,
    /// Whether another page should be fetched this run.
    pub more: bool,
}

/// Static dispatch over the configured providers. Matches the closed
/// set of `ProviderKind` variants; adding a provider adds one arm.
pub enum ProviderClient {
    Strava(strava::StravaClient),
    Garmin(garmin::GarminClient),
    Nike(nike::NikeClient),
    Keep(keep::KeepClient),
    Folder(folder::FolderClient),
}

impl ProviderClient {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderClient::Strava(_) => ProviderKind::Strava,
            ProviderClient::Garmin(_) => ProviderKind::Garmin,
            ProviderClient::Nike(_) => ProviderKind::Nike,
            ProviderClient::Keep(_) => ProviderKind::Keep,
            ProviderClient::Folder(_) => ProviderKind::Folder,
        }
    }

    pub async fn authenticate(&mut self) -> Result<(), SyncError> {
        match self {
            ProviderClient::Strava(c) => c.authenticate().await,
            ProviderClient::Garmin(c) => c.authenticate().await,
            ProviderClient::Nike(c) => c.authenticate().await,
            ProviderClient::Keep(c) => c.authenticate().await,
            ProviderClient::Folder(_) => Ok(()),
        }
    }

    pub async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page, SyncError> {
        match self {
            ProviderClient::Strava(c) => c.fetch_page(cursor).await,
            ProviderClient::Garmin(c) => c.fetch_page(cursor).await,
            ProviderClient::Nike(c) => c.fetch_page(cursor).await,
            ProviderClient::Keep(c) => c.fetch_page(cursor).await,
            ProviderClient::Folder(c) => c.fetch_page(cursor).await,
        }
    }
}

/// HTTP client with transient-error retry middleware, shared by every
/// network-backed provider.
pub(crate) fn http_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
    let inner = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .cookie_store(true)
        .build()
        .expect("failed to construct HTTP client");
    ClientBuilder::new(inner)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

/// Send a request, backing off and retrying a bounded number of times
/// on HTTP 429 before surfacing `RateLimitExceeded`.
pub(crate) async fn send_with_backoff(
    provider: ProviderKind,
    request: RequestBuilder,
) -> Result<reqwest::Response, SyncError> {
    let mut delay = RATE_LIMIT_BASE_DELAY;
    for attempt in 1..=RATE_LIMIT_ATTEMPTS {
        let cloned = request
            .try_clone()
            .ok_or_else(|| SyncError::network(provider, "request body is not cloneable"))?;
        let response = cloned
            .send()
            .await
            .map_err(|e| SyncError::network(provider, e))?;

        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }
        if attempt < RATE_LIMIT_ATTEMPTS {
            warn!(
                "{provider}: rate limited, backing off {}s (attempt {attempt}/{RATE_LIMIT_ATTEMPTS})",
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(SyncError::RateLimitExceeded { provider })
}

/// Load a provider's cached (refreshed) credential, if one was
/// persisted by an earlier run.
pub(crate) fn load_cached_credential<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Persist a refreshed credential next to the data. Best effort: a
/// failure here only costs a re-authentication on the next run.
pub(crate) fn store_cached_credential<T: Serialize>(path: &Path, value: &T) {
    let result = serde_json::to_vec_pretty(value)
        .map_err(std::io::Error::other)
        .and_then(|bytes| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)
        });
    if let Err(e) = result {
        warn!("Failed to cache credential at {}: {e}", path.display());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    // A client without the transient-retry middleware, so the scripted
    // 429s reach `send_with_backoff` itself.
    fn bare_client() -> ClientWithMiddleware {
        ClientBuilder::new(reqwest::Client::new()).build()
    }

    #[tokio::test]
    async fn backoff_recovers_once_the_rate_limit_clears() {
        let (url, hits) = stub_server::spawn(vec![(429, ""), (200, "{}")]).await;

        let response = send_with_backoff(ProviderKind::Strava, bare_client().get(&url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backoff_gives_up_after_bounded_attempts() {
        let (url, hits) = stub_server::spawn(vec![(429, "")]).await;

        let err = send_with_backoff(ProviderKind::Garmin, bare_client().get(&url))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::RateLimitExceeded {
                provider: ProviderKind::Garmin
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), RATE_LIMIT_ATTEMPTS as usize);
    }
}
