//! Garmin Connect: exchanges a long-lived consumer token for a
//! short-lived bearer, pages the activity search endpoint by offset,
//! and downloads the original GPX export per activity.
//!
//! `is_cn` flips every endpoint to the China-region deployment.

use crate::activity::ProviderKind;
use crate::error::SyncError;
use crate::providers::{Page, RawActivity, http_client, send_with_backoff};
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::{debug, info, warn};

const PAGE_SIZE: usize = 20;
const DOWNLOAD_CONCURRENCY: usize = 4;

const PROVIDER: ProviderKind = ProviderKind::Garmin;

#[derive(Debug, Clone)]
pub struct GarminConfig {
    /// Long-lived OAuth consumer token issued to this installation.
    pub secret_token: String,
    /// Use the garmin.cn regional deployment.
    pub is_cn: bool,
}

impl GarminConfig {
    fn api_base(&self) -> &'static str {
        if self.is_cn {
            "https://connectapi.garmin.cn"
        } else {
            "https://connectapi.garmin.com"
        }
    }
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GarminActivity {
    pub activity_id: u64,
    pub activity_name: Option<String>,
    pub activity_type: Option<GarminActivityType>,
    /// "2024-05-01 08:30:00", athlete-local.
    pub start_time_local: Option<String>,
    #[serde(rename = "startTimeGMT")]
    pub start_time_gmt: Option<String>,
    pub distance: Option<f64>,
    /// Seconds.
    pub duration: Option<f64>,
    pub elevation_gain: Option<f64>,
    #[serde(rename = "averageHR")]
    pub average_hr: Option<f64>,
    pub average_speed: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GarminActivityType {
    pub type_key: String,
}

/// One fetched Garmin activity: the list-endpoint summary plus the GPX
/// document for its track, when the activity has one.
#[derive(Debug, Clone)]
pub struct GarminRaw {
    pub summary: GarminActivity,
    pub gpx: Option<String>,
}

pub struct GarminClient {
    http: ClientWithMiddleware,
    config: GarminConfig,
    access_token: Option<String>,
    /// In-run paging offset. Never persisted: the listing is
    /// newest-first, so an offset from a previous run would point at
    /// different activities once new ones are recorded.
    offset: usize,
    /// Newest start epoch seen this run, the next high-water mark.
    newest_seen: Option<i64>,
}

impl GarminClient {
    pub fn new(config: GarminConfig) -> Self {
        Self {
            http: http_client(),
            config,
            access_token: None,
            offset: 0,
            newest_seen: None,
        }
    }

    pub async fn authenticate(&mut self) -> Result<(), SyncError> {
        let url = format!(
            "{}/oauth-service/oauth/exchange/user/2.0",
            self.config.api_base()
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.secret_token)
            .send()
            .await
            .map_err(|e| SyncError::auth(PROVIDER, e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::auth(
                PROVIDER,
                format!("token exchange returned HTTP {}", response.status()),
            ));
        }
        let exchanged: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| SyncError::auth(PROVIDER, e.to_string()))?;
        self.access_token = Some(exchanged.access_token);
        info!("Garmin authentication succeeded (cn={})", self.config.is_cn);
        Ok(())
    }

    pub async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page, SyncError> {
        // Cursor is the GMT start epoch of the newest committed
        // activity. The search endpoint returns newest-first, so every
        // run pages from offset zero and stops once a page reaches the
        // cursor; anything at or before it was synced by a prior run.
        let since: i64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(i64::MIN);

        let mut response = self.list_activities(self.offset).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("Garmin bearer expired, re-authenticating once");
            self.authenticate().await?;
            response = self.list_activities(self.offset).await?;
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

        let summaries: Vec<GarminActivity> = response
            .json()
            .await
            .map_err(|e| SyncError::network(PROVIDER, e))?;
        let count = summaries.len();
        self.offset += count;

        let (fresh, reached_cursor) = split_at_cursor(summaries, since);
        if let Some(epoch) = fresh.iter().filter_map(start_epoch).max() {
            self.newest_seen = Some(self.newest_seen.unwrap_or(i64::MIN).max(epoch));
        }

        let this = &*self;
        let raw: Vec<RawActivity> = stream::iter(fresh)
            .map(|summary| async move {
                let gpx = match this.download_gpx(summary.activity_id).await {
                    Ok(gpx) => gpx,
                    Err(e) => {
                        warn!(
                            "Failed to download GPX for Garmin activity {}: {e}",
                            summary.activity_id
                        );
                        None
                    }
                };
                RawActivity::Garmin(GarminRaw { summary, gpx })
            })
            .buffer_unordered(DOWNLOAD_CONCURRENCY)
            .collect()
            .await;

        let more = count >= PAGE_SIZE && !reached_cursor;
        // The high-water mark commits only with the final page, so an
        // interrupted run resumes from the previous cursor and lets the
        // store's fingerprint skip the refetched records.
        let next_cursor = if more {
            None
        } else {
            self.newest_seen.filter(|e| *e > since).map(|e| e.to_string())
        };
        Ok(Page {
            raw,
            next_cursor,
            more,
        })
    }

    async fn list_activities(&self, start: usize) -> Result<reqwest::Response, SyncError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let url = format!(
            "{}/activitylist-service/activities/search/activities",
            self.config.api_base()
        );
        let request = self.http.get(url).bearer_auth(token).query(&[
            ("start", start.to_string()),
            ("limit", PAGE_SIZE.to_string()),
        ]);
        send_with_backoff(PROVIDER, request).await
    }

    /// Fetch the original GPX export. Activities without geographic
    /// data (treadmill, pool swims) come back 404; that is a valid
    /// state, not an error.
    async fn download_gpx(&self, activity_id: u64) -> Result<Option<String>, SyncError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth(PROVIDER, "not authenticated"))?;
        let url = format!(
            "{}/download-service/export/gpx/activity/{activity_id}",
            self.config.api_base()
        );
        let request = self.http.get(url).bearer_auth(token);
        let response = send_with_backoff(PROVIDER, request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| SyncError::network(PROVIDER, e))?;
                Ok((!body.trim().is_empty()).then_some(body))
            }
            status => Err(SyncError::Http {
                provider: PROVIDER,
                status,
            }),
        }
    }
}

/// GMT start epoch of a listed activity, when it parses.
fn start_epoch(activity: &GarminActivity) -> Option<i64> {
    let naive =
        NaiveDateTime::parse_from_str(activity.start_time_gmt.as_deref()?, "%Y-%m-%d %H:%M:%S")
            .ok()?;
    Some(naive.and_utc().timestamp())
}

/// Split a newest-first page at the cursor. The first entry at or
/// before `since` marks where prior runs left off; everything from
/// there on, and every later page, is already synced. Entries without
/// a parsable start time are kept and left to the fingerprint check.
fn split_at_cursor(summaries: Vec<GarminActivity>, since: i64) -> (Vec<GarminActivity>, bool) {
    let mut fresh = Vec::with_capacity(summaries.len());
    for summary in summaries {
        if matches!(start_epoch(&summary), Some(epoch) if epoch <= since) {
            return (fresh, true);
        }
        fresh.push(summary);
    }
    (fresh, false)
}
