//! Local-folder provider: ingests GPX and FIT exports dropped into a
//! directory. No authentication and no pagination; the whole directory
//! is one full dump and the store's fingerprinting keeps re-runs cheap.

use crate::activity::{ProviderKind, TrackPoint};
use crate::error::SyncError;
use crate::providers::{Page, RawActivity};
use crate::track_export::gpx_time_to_chrono;
use chrono::{DateTime, FixedOffset};
use fitparser::Value;
use fitparser::profile::MesgNum;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PROVIDER: ProviderKind = ProviderKind::Folder;

const SEMICIRCLES_TO_DEGREES: f64 = 180.0 / 2147483648.0;

#[derive(Debug, Clone)]
pub struct FolderConfig {
    pub dir: PathBuf,
}

/// A parsed track file. Already close to canonical shape; the
/// normalizer fills in the sport mapping and derived metrics.
#[derive(Debug, Clone)]
pub struct FolderActivity {
    /// File stem; stable as long as the file is not renamed.
    pub native_id: String,
    pub sport_hint: Option<String>,
    pub name: Option<String>,
    pub start_time: Option<DateTime<FixedOffset>>,
    pub duration_seconds: Option<u64>,
    pub distance_meters: Option<f64>,
    pub average_heart_rate: Option<f64>,
    pub average_speed: Option<f64>,
    pub track: Vec<TrackPoint>,
}

pub struct FolderClient {
    config: FolderConfig,
}

impl FolderClient {
    pub fn new(config: FolderConfig) -> Self {
        Self { config }
    }

    pub async fn fetch_page(&mut self, _cursor: Option<&str>) -> Result<Page, SyncError> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.config.dir)
            .map_err(|e| {
                SyncError::network(
                    PROVIDER,
                    format!("cannot read {}: {e}", self.config.dir.display()),
                )
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("gpx") | Some("fit") | Some("GPX") | Some("FIT")
                )
            })
            .collect();
        entries.sort();

        info!(
            "Found {} track files in {}",
            entries.len(),
            self.config.dir.display()
        );

        let mut raw = Vec::with_capacity(entries.len());
        for path in entries {
            match parse_file(&path) {
                Ok(activity) => raw.push(RawActivity::Folder(activity)),
                Err(e) => warn!("Skipping unreadable track file {}: {e}", path.display()),
            }
        }

        Ok(Page {
            raw,
            next_cursor: None,
            more: false,
        })
    }
}

fn parse_file(path: &Path) -> Result<FolderActivity, SyncError> {
    let native_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| SyncError::malformed(PROVIDER, path.display().to_string(), "bad file name"))?;

    let is_fit = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("fit"));
    if is_fit {
        let data = fs::read(path).map_err(|e| SyncError::malformed(PROVIDER, &native_id, e))?;
        parse_fit(&native_id, &data)
    } else {
        let file = fs::File::open(path).map_err(|e| SyncError::malformed(PROVIDER, &native_id, e))?;
        parse_gpx(&native_id, BufReader::new(file))
    }
}

fn parse_gpx<R: std::io::Read>(native_id: &str, reader: R) -> Result<FolderActivity, SyncError> {
    let gpx = gpx::read(reader).map_err(|e| SyncError::malformed(PROVIDER, native_id, e))?;

    let mut track = Vec::new();
    let mut sport_hint = None;
    let mut name = gpx.metadata.as_ref().and_then(|m| m.name.clone());

    for gpx_track in &gpx.tracks {
        if sport_hint.is_none() {
            sport_hint = gpx_track.type_.clone();
        }
        if name.is_none() {
            name = gpx_track.name.clone();
        }
        for segment in &gpx_track.segments {
            for waypoint in &segment.points {
                track.push(TrackPoint {
                    lat: waypoint.point().y(),
                    lon: waypoint.point().x(),
                    elevation: waypoint.elevation,
                    time: waypoint.time.map(gpx_time_to_chrono),
                });
            }
        }
    }

    let start_time = track.iter().find_map(|p| p.time);
    let end_time = track.iter().rev().find_map(|p| p.time);
    let duration_seconds = match (start_time, end_time) {
        (Some(start), Some(end)) if end >= start => Some((end - start).num_seconds() as u64),
        _ => None,
    };

    Ok(FolderActivity {
        native_id: native_id.to_string(),
        sport_hint,
        name,
        start_time,
        duration_seconds,
        distance_meters: None,
        average_heart_rate: None,
        average_speed: None,
        track,
    })
}

fn parse_fit(native_id: &str, data: &[u8]) -> Result<FolderActivity, SyncError> {
    let records =
        fitparser::from_bytes(data).map_err(|e| SyncError::malformed(PROVIDER, native_id, e))?;

    let mut activity = FolderActivity {
        native_id: native_id.to_string(),
        sport_hint: None,
        name: None,
        start_time: None,
        duration_seconds: None,
        distance_meters: None,
        average_heart_rate: None,
        average_speed: None,
        track: Vec::new(),
    };

    for record in &records {
        match record.kind() {
            MesgNum::Session => {
                for field in record.fields() {
                    match field.name() {
                        "sport" => {
                            if let Value::String(sport) = field.value() {
                                activity.sport_hint = Some(sport.clone());
                            }
                        }
                        "start_time" => {
                            if let Value::Timestamp(ts) = field.value() {
                                activity.start_time = Some(ts.fixed_offset());
                            }
                        }
                        "total_distance" => activity.distance_meters = value_f64(field.value()),
                        "total_elapsed_time" => {
                            activity.duration_seconds =
                                value_f64(field.value()).map(|s| s.round() as u64)
                        }
                        "avg_heart_rate" => activity.average_heart_rate = value_f64(field.value()),
                        "enhanced_avg_speed" | "avg_speed" => {
                            if activity.average_speed.is_none() {
                                activity.average_speed = value_f64(field.value());
                            }
                        }
                        _ => {}
                    }
                }
            }
            MesgNum::Record => {
                let mut lat = None;
                let mut lon = None;
                let mut elevation = None;
                let mut time = None;
                for field in record.fields() {
                    match field.name() {
                        "position_lat" => {
                            lat = value_f64(field.value()).map(|v| v * SEMICIRCLES_TO_DEGREES)
                        }
                        "position_long" => {
                            lon = value_f64(field.value()).map(|v| v * SEMICIRCLES_TO_DEGREES)
                        }
                        "enhanced_altitude" | "altitude" => {
                            if elevation.is_none() {
                                elevation = value_f64(field.value());
                            }
                        }
                        "timestamp" => {
                            if let Value::Timestamp(ts) = field.value() {
                                time = Some(ts.fixed_offset());
                            }
                        }
                        _ => {}
                    }
                }
                if let (Some(lat), Some(lon)) = (lat, lon) {
                    activity.track.push(TrackPoint {
                        lat,
                        lon,
                        elevation,
                        time,
                    });
                }
            }
            _ => {}
        }
    }

    if activity.start_time.is_none() {
        activity.start_time = activity.track.iter().find_map(|p| p.time);
    }
    Ok(activity)
}

fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::SInt8(v) => Some(f64::from(*v)),
        Value::UInt8(v) | Value::UInt8z(v) | Value::Byte(v) => Some(f64::from(*v)),
        Value::SInt16(v) => Some(f64::from(*v)),
        Value::UInt16(v) | Value::UInt16z(v) => Some(f64::from(*v)),
        Value::SInt32(v) => Some(f64::from(*v)),
        Value::UInt32(v) | Value::UInt32z(v) => Some(f64::from(*v)),
        Value::SInt64(v) => Some(*v as f64),
        Value::UInt64(v) | Value::UInt64z(v) => Some(*v as f64),
        Value::Float32(v) => Some(f64::from(*v)),
        Value::Float64(v) => Some(*v),
        _ => None,
    }
}
