//! Keep (gotokeep.com): session login with mobile number and password,
//! running-log pagination driven by the `lastDate` timestamp the stats
//! endpoint hands back, and per-log geo points fetched individually.

use crate::activity::{ProviderKind, TrackPoint};
use crate::error::SyncError;
use crate::providers::{
    Page, RawActivity, http_client, load_cached_credential, send_with_backoff,
    store_cached_credential,
};
use chrono::{DateTime, Offset, Utc};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOGIN_URL: &str = "https://api.gotokeep.com/v1.1/users/login";
const STATS_URL: &str = "https://api.gotokeep.com/pd/v3/stats/detail";
const LOG_URL: &str = "https://api.gotokeep.com/pd/v3/runninglog";

const DOWNLOAD_CONCURRENCY: usize = 4;

const PROVIDER: ProviderKind = ProviderKind::Keep;

#[derive(Debug, Clone)]
pub struct KeepConfig {
    pub mobile: String,
    pub password: String,
}

/// Session tokens stay valid for a while; caching one avoids a login
/// (and the SMS-risk that comes with too many logins) on every run.
#[derive(Serialize, Deserialize)]
struct CachedSession {
    token: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    data: Option<LoginData>,
}

#[derive(Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Deserialize)]
struct StatsResponse {
    data: Option<StatsData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsData {
    #[serde(default)]
    records: Vec<StatsRecord>,
    #[serde(default)]
    last_timestamp: i64,
}

#[derive(Deserialize)]
struct StatsRecord {
    #[serde(default)]
    logs: Vec<StatsLogEntry>,
}

#[derive(Deserialize)]
struct StatsLogEntry {
    stats: KeepLog,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepLog {
    pub id: String,
    pub name: Option<String>,
    /// Epoch milliseconds, UTC.
    pub start_time: Option<i64>,
    /// Seconds.
    pub duration: Option<f64>,
    /// Meters.
    pub distance: Option<f64>,
    pub average_heart_rate: Option<f64>,
    /// Seconds east of UTC for the athlete's timezone.
    pub timezone_offset: Option<i32>,
    pub sport_type: Option<String>,
}

#[derive(Deserialize)]
struct LogDetailResponse {
    data: Option<LogDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogDetail {
    #[serde(default)]
    geo_points: Vec<GeoPoint>,
}

#[derive(Deserialize)]
struct GeoPoint {
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
    timestamp: Option<i64>,
}

/// One fetched Keep log: the stats summary plus its geo points.
#[derive(Debug, Clone)]
pub struct KeepRaw {
    pub summary: KeepLog,
    pub track: Vec<TrackPoint>,
}

pub struct KeepClient {
    http: ClientWithMiddleware,
    config: KeepConfig,
    token: Option<String>,
    auth_cache: PathBuf,
}

impl KeepClient {
    pub fn new(config: KeepConfig, data_dir: &Path) -> Self {
        let auth_cache = data_dir.join("auth").join("keep.json");
        let token = load_cached_credential::<CachedSession>(&auth_cache).map(|c| c.token);
        if token.is_some() {
            debug!("Using cached Keep session token");
        }
        Self {
            http: http_client(),
            config,
            token,
            auth_cache,
        }
    }

    pub async fn authenticate(&mut self) -> Result<(), SyncError> {
        if self.token.is_some() {
            // Cached session; if it turns out stale the fetch path
            // re-logins once.
            return Ok(());
        }
        self.login().await
    }

    async fn login(&mut self) -> Result<(), SyncError> {
        let body = serde_json::json!({
            "mobile": self.config.mobile,
            "password": self.config.password,
        });
        let response = self
            .http
            .post(LOGIN_URL)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::auth(PROVIDER, e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::auth(
                PROVIDER,
                format!("login returned HTTP {}", response.status()),
            ));
        }
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| SyncError::auth(PROVIDER, e.to_string()))?;
        let token = login
            .data
            .map(|d| d.token)
            .ok_or_else(|| SyncError::auth(PROVIDER, "login response carried no token"))?;

        store_cached_credential(&self.auth_cache, &CachedSession { token: token.clone() });
        self.token = Some(token);
        info!("Keep login succeeded");
        Ok(())
    }

    pub async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page, SyncError> {
        // Cursor is the `lastTimestamp` from the previous stats page;
        // 0 asks for the newest logs.
        let last_date: i64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let mut response = self.list_logs(last_date).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("Keep session expired, logging in again");
            self.token = None;
            self.login().await?;
            response = self.list_logs(last_date).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(SyncError::auth(PROVIDER, "session rejected after re-login"));
            }
        }
        if !response.status().is_success() {
            return Err(SyncError::Http {
                provider: PROVIDER,
                status: response.status(),
            });
        }

        let stats: StatsResponse = response
            .json()
            .await
            .map_err(|e| SyncError::network(PROVIDER, e))?;
        let data = stats
            .data
            .ok_or_else(|| SyncError::network(PROVIDER, "stats response carried no data"))?;
        let summaries: Vec<KeepLog> = data
            .records
            .into_iter()
            .flat_map(|r| r.logs)
            .map(|l| l.stats)
            .collect();

        let this = &*self;
        let raw: Vec<RawActivity> = stream::iter(summaries)
            .map(|summary| async move {
                let track = match this.fetch_geo_points(&summary.id).await {
                    Ok(track) => track,
                    Err(e) => {
                        warn!("Failed to fetch geo points for Keep log {}: {e}", summary.id);
                        Vec::new()
                    }
                };
                RawActivity::Keep(KeepRaw { summary, track })
            })
            .buffer_unordered(DOWNLOAD_CONCURRENCY)
            .collect()
            .await;

        // lastTimestamp == 0 means the history is exhausted.
        let more = data.last_timestamp > 0;
        let next_cursor = more.then(|| data.last_timestamp.to_string());
        Ok(Page {
            raw,
            next_cursor,
            more,
        })
    }

    async fn list_logs(&self, last_date: i64) -> Result<reqwest::Response, SyncError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let last_date = last_date.to_string();
        let request = self
            .http
            .get(STATS_URL)
            .header("Authorization", format!("Bearer {token}"))
            .query(&[
                ("dateUnit", "all"),
                ("type", "running"),
                ("lastDate", last_date.as_str()),
            ]);
        send_with_backoff(PROVIDER, request).await
    }

    async fn fetch_geo_points(&self, log_id: &str) -> Result<Vec<TrackPoint>, SyncError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let request = self
            .http
            .get(format!("{LOG_URL}/{log_id}"))
            .header("Authorization", format!("Bearer {token}"));
        let response = send_with_backoff(PROVIDER, request).await?;
        if !response.status().is_success() {
            return Err(SyncError::Http {
                provider: PROVIDER,
                status: response.status(),
            });
        }
        let detail: LogDetailResponse = response
            .json()
            .await
            .map_err(|e| SyncError::network(PROVIDER, e))?;

        let utc = Utc.fix();
        let track = detail
            .data
            .map(|d| d.geo_points)
            .unwrap_or_default()
            .into_iter()
            .map(|p| TrackPoint {
                lat: p.latitude,
                lon: p.longitude,
                elevation: p.altitude,
                time: p
                    .timestamp
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|t| t.with_timezone(&utc)),
            })
            .collect();
        Ok(track)
    }
}
