//! Nike Run Club: bearer auth via a refresh-token grant against the
//! Nike identity shim, cursor pagination with `after_time`, and metric
//! streams (latitude/longitude/elevation) zipped into track points.

use crate::activity::{ProviderKind, TrackPoint};
use crate::error::SyncError;
use crate::providers::{Page, RawActivity, http_client, send_with_backoff};
use chrono::{DateTime, Offset, Utc};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::{debug, info, warn};

const TOKEN_URL: &str = "https://api.nike.com/idn/shim/oauth/2.0/token";
const API_BASE: &str = "https://api.nike.com/sport/v3/me";
// Public identifiers of the Nike Run Club mobile app; the refresh token
// is the only secret.
const CLIENT_ID: &str = "VhAeafEGJ6G8e9DxRUz8iE50CZ9MiJMG";
const UX_ID: &str = "com.nike.sport.running.ios.5.15";

const DOWNLOAD_CONCURRENCY: usize = 4;

const PROVIDER: ProviderKind = ProviderKind::Nike;

#[derive(Debug, Clone)]
pub struct NikeConfig {
    pub refresh_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NikeActivity {
    pub id: String,
    #[serde(rename = "type")]
    pub activity_type: Option<String>,
    pub start_epoch_ms: i64,
    pub end_epoch_ms: Option<i64>,
    pub active_duration_ms: Option<i64>,
    #[serde(default)]
    pub summaries: Vec<NikeSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NikeSummary {
    pub metric: String,
    pub value: f64,
}

#[derive(Deserialize)]
struct ActivityList {
    #[serde(default)]
    activities: Vec<NikeActivity>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Default, Deserialize)]
struct Paging {
    after_time: Option<i64>,
}

#[derive(Deserialize)]
struct ActivityDetail {
    #[serde(default)]
    metrics: Vec<NikeMetric>,
}

#[derive(Deserialize)]
struct NikeMetric {
    #[serde(rename = "type")]
    metric_type: String,
    #[serde(default)]
    values: Vec<NikeMetricValue>,
}

#[derive(Deserialize)]
struct NikeMetricValue {
    start_epoch_ms: i64,
    value: f64,
}

/// One fetched Nike activity: the list summary plus the track built
/// from the latitude/longitude/elevation metric streams.
#[derive(Debug, Clone)]
pub struct NikeRaw {
    pub summary: NikeActivity,
    pub track: Vec<TrackPoint>,
}

pub struct NikeClient {
    http: ClientWithMiddleware,
    config: NikeConfig,
    access_token: Option<String>,
}

impl NikeClient {
    pub fn new(config: NikeConfig) -> Self {
        Self {
            http: http_client(),
            config,
            access_token: None,
        }
    }

    pub async fn authenticate(&mut self) -> Result<(), SyncError> {
        let body = serde_json::json!({
            "client_id": CLIENT_ID,
            "ux_id": UX_ID,
            "grant_type": "refresh_token",
            "refresh_token": self.config.refresh_token,
        });
        let response = self
            .http
            .post(TOKEN_URL)
            .json(&body)
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
        self.access_token = Some(token.access_token);
        info!("Nike authentication succeeded");
        Ok(())
    }

    pub async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page, SyncError> {
        // Cursor is the `after_time` milliseconds returned by the
        // previous page's paging block.
        let after_ms: i64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let mut response = self.list_activities(after_ms).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("Nike access token rejected, re-authenticating once");
            self.authenticate().await?;
            response = self.list_activities(after_ms).await?;
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

        let list: ActivityList = response
            .json()
            .await
            .map_err(|e| SyncError::network(PROVIDER, e))?;

        let this = &*self;
        let raw: Vec<RawActivity> = stream::iter(list.activities)
            .map(|summary| async move {
                let track = match this.fetch_track(&summary.id).await {
                    Ok(track) => track,
                    Err(e) => {
                        warn!("Failed to fetch metrics for Nike activity {}: {e}", summary.id);
                        Vec::new()
                    }
                };
                RawActivity::Nike(NikeRaw { summary, track })
            })
            .buffer_unordered(DOWNLOAD_CONCURRENCY)
            .collect()
            .await;

        let next_cursor = list.paging.after_time.map(|t| t.to_string());
        let more = next_cursor.is_some();
        Ok(Page {
            raw,
            next_cursor,
            more,
        })
    }

    async fn list_activities(&self, after_ms: i64) -> Result<reqwest::Response, SyncError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let request = self
            .http
            .get(format!("{API_BASE}/activities/after_time/{after_ms}"))
            .bearer_auth(token)
            .query(&[("limit", "30")]);
        send_with_backoff(PROVIDER, request).await
    }

    /// Build the track by zipping the latitude and longitude metric
    /// streams; elevation is joined by index when the stream lines up.
    async fn fetch_track(&self, activity_id: &str) -> Result<Vec<TrackPoint>, SyncError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let request = self
            .http
            .get(format!("{API_BASE}/activity/{activity_id}"))
            .bearer_auth(token)
            .query(&[("metrics", "ALL")]);
        let response = send_with_backoff(PROVIDER, request).await?;
        if !response.status().is_success() {
            return Err(SyncError::Http {
                provider: PROVIDER,
                status: response.status(),
            });
        }
        let detail: ActivityDetail = response
            .json()
            .await
            .map_err(|e| SyncError::network(PROVIDER, e))?;

        let mut latitudes = None;
        let mut longitudes = None;
        let mut elevations = None;
        for metric in detail.metrics {
            match metric.metric_type.as_str() {
                "latitude" => latitudes = Some(metric.values),
                "longitude" => longitudes = Some(metric.values),
                "elevation" => elevations = Some(metric.values),
                _ => {}
            }
        }
        let (Some(latitudes), Some(longitudes)) = (latitudes, longitudes) else {
            // No GPS streams: indoor run.
            return Ok(Vec::new());
        };
        let elevations = elevations.unwrap_or_default();

        let utc = Utc.fix();
        let track = latitudes
            .iter()
            .zip(longitudes.iter())
            .enumerate()
            .map(|(i, (lat, lon))| TrackPoint {
                lat: lat.value,
                lon: lon.value,
                elevation: elevations.get(i).map(|e| e.value),
                time: DateTime::<Utc>::from_timestamp_millis(lat.start_epoch_ms)
                    .map(|t| t.with_timezone(&utc)),
            })
            .collect();
        Ok(track)
    }
}
