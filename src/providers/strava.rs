//! Strava: OAuth refresh-token grant, offset-free pagination driven by
//! the `after` query parameter, summary polylines for tracks.

use crate::activity::ProviderKind;
use crate::error::SyncError;
use crate::providers::{
    Page, RawActivity, http_client, load_cached_credential, send_with_backoff,
    store_cached_credential,
};
use chrono::DateTime;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const API_BASE: &str = "https://www.strava.com/api/v3";
const TOKEN_URL: &str = "https://www.strava.com/oauth/token";
const PAGE_SIZE: usize = 100;

const PROVIDER: ProviderKind = ProviderKind::Strava;

#[derive(Debug, Clone)]
pub struct StravaConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Strava rotates refresh tokens; the latest one is cached on disk so
/// the configured token going stale does not break future runs.
#[derive(Serialize, Deserialize)]
struct CachedAuth {
    refresh_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StravaActivity {
    pub id: u64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub activity_type: Option<String>,
    /// UTC start, RFC 3339.
    pub start_date: String,
    /// Seconds east of UTC for the activity's local timezone.
    pub utc_offset: Option<f64>,
    pub distance: Option<f64>,
    pub moving_time: Option<u64>,
    pub elapsed_time: Option<u64>,
    pub total_elevation_gain: Option<f64>,
    pub average_heartrate: Option<f64>,
    pub average_speed: Option<f64>,
    pub map: Option<StravaMap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StravaMap {
    pub summary_polyline: Option<String>,
}

pub struct StravaClient {
    http: ClientWithMiddleware,
    config: StravaConfig,
    access_token: Option<String>,
    auth_cache: PathBuf,
    token_url: String,
    api_base: String,
}

impl StravaClient {
    pub fn new(mut config: StravaConfig, data_dir: &Path) -> Self {
        let auth_cache = data_dir.join("auth").join("strava.json");
        if let Some(cached) = load_cached_credential::<CachedAuth>(&auth_cache) {
            debug!("Using cached Strava refresh token");
            config.refresh_token = cached.refresh_token;
        }
        Self {
            http: http_client(),
            config,
            access_token: None,
            auth_cache,
            token_url: TOKEN_URL.to_string(),
            api_base: API_BASE.to_string(),
        }
    }

    pub async fn authenticate(&mut self) -> Result<(), SyncError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| SyncError::auth(PROVIDER, e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::auth(
                PROVIDER,
                format!("token refresh returned HTTP {}", response.status()),
            ));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::auth(PROVIDER, e.to_string()))?;

        if let Some(refresh) = &token.refresh_token {
            if *refresh != self.config.refresh_token {
                self.config.refresh_token = refresh.clone();
                store_cached_credential(
                    &self.auth_cache,
                    &CachedAuth {
                        refresh_token: refresh.clone(),
                    },
                );
            }
        }
        self.access_token = Some(token.access_token);
        info!("Strava authentication succeeded");
        Ok(())
    }

    pub async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page, SyncError> {
        // Cursor is the epoch second of the newest committed activity.
        let after: i64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let mut response = self.list_activities(after).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("Strava access token rejected, re-authenticating once");
            self.authenticate().await?;
            response = self.list_activities(after).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(SyncError::auth(PROVIDER, "token rejected after refresh"));
            }
        }
        if !response.status().is_success() {
            return Err(SyncError::Http {
                provider: PROVIDER,
                status: response.status(),
            });
        }

        let batch: Vec<StravaActivity> = response
            .json()
            .await
            .map_err(|e| SyncError::network(PROVIDER, e))?;

        // With `after` set Strava returns oldest-first, so the newest
        // start time in the batch is the next continuation point.
        let next_cursor = batch
            .iter()
            .filter_map(|a| DateTime::parse_from_rfc3339(&a.start_date).ok())
            .map(|t| t.timestamp())
            .max()
            .map(|t| t.to_string());
        let more = batch.len() >= PAGE_SIZE;

        Ok(Page {
            raw: batch.into_iter().map(RawActivity::Strava).collect(),
            next_cursor,
            more,
        })
    }

    async fn list_activities(&self, after: i64) -> Result<reqwest::Response, SyncError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let request = self
            .http
            .get(format!("{}/athlete/activities", self.api_base))
            .bearer_auth(token)
            .query(&[
                ("after", after.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
            ]);
        send_with_backoff(PROVIDER, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stub_server;
    use tempdir::TempDir;

    fn client_against(base: &str, data_dir: &Path) -> StravaClient {
        let mut client = StravaClient::new(
            StravaConfig {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                refresh_token: "refresh".to_string(),
            },
            data_dir,
        );
        client.token_url = format!("{base}/oauth/token");
        client.api_base = base.to_string();
        client.access_token = Some("stale".to_string());
        client
    }

    #[tokio::test]
    async fn rejected_token_triggers_one_reauth_then_the_page_retries() {
        let dir = TempDir::new("strava").unwrap();
        // Listing rejects the stale token, the refresh grant succeeds,
        // the retried listing answers.
        let (base, hits) = stub_server::spawn(vec![
            (401, ""),
            (200, r#"{"access_token": "fresh"}"#),
            (200, "[]"),
        ])
        .await;

        let mut client = client_against(&base, dir.path());
        let page = client.fetch_page(None).await.unwrap();

        assert!(page.raw.is_empty());
        assert!(!page.more);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn token_rejected_even_after_refresh_is_an_auth_error() {
        let dir = TempDir::new("strava").unwrap();
        let (base, _hits) = stub_server::spawn(vec![
            (401, ""),
            (200, r#"{"access_token": "fresh"}"#),
            (401, ""),
        ])
        .await;

        let mut client = client_against(&base, dir.path());
        let err = client.fetch_page(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth { .. }));
    }
}
