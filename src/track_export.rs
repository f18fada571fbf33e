//! GPX encoding of canonical tracks. One file per activity, named from
//! its identity; the files are derived data, always regenerable from
//! the store.

use crate::activity::{Activity, TrackPoint};
use crate::error::SyncError;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use geo::Point;
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};
use std::fs;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

pub const TRACKS_DIR: &str = "tracks";

/// Deterministic file name for an activity's track.
pub fn track_file_path(data_dir: &Path, activity: &Activity) -> PathBuf {
    data_dir
        .join(TRACKS_DIR)
        .join(format!("{}_{}.gpx", activity.source, activity.native_id))
}

/// Write the activity's track as GPX 1.1. Returns `None` without
/// touching the filesystem when the track is empty.
pub fn export(data_dir: &Path, activity: &Activity) -> Result<Option<PathBuf>, SyncError> {
    if activity.track.is_empty() {
        return Ok(None);
    }

    let mut segment = TrackSegment::new();
    for point in &activity.track {
        let mut waypoint = Waypoint::new(Point::new(point.lon, point.lat));
        waypoint.elevation = point.elevation;
        waypoint.time = point.time.map(chrono_to_gpx_time);
        segment.points.push(waypoint);
    }

    let mut track = Track::new();
    track.name = activity.name.clone();
    track.type_ = Some(activity.sport.to_string());
    track.segments.push(segment);

    let mut gpx = Gpx::default();
    gpx.version = GpxVersion::Gpx11;
    gpx.creator = Some("paceline".to_string());
    gpx.tracks.push(track);

    let path = track_file_path(data_dir, activity);
    let encoding_error = |e: &dyn std::fmt::Display| SyncError::TrackEncoding {
        id: activity.identity(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| encoding_error(&e))?;
    }
    let file = fs::File::create(&path).map_err(|e| encoding_error(&e))?;
    gpx::write(&gpx, BufWriter::new(file)).map_err(|e| encoding_error(&e))?;
    Ok(Some(path))
}

/// Decode the track points of a GPX document, in order. Shared by the
/// Garmin download path and the round-trip tests.
pub fn decode_gpx<R: Read>(reader: R) -> Result<Vec<TrackPoint>, gpx::errors::GpxError> {
    let gpx = gpx::read(reader)?;
    let mut points = Vec::new();
    for track in &gpx.tracks {
        for segment in &track.segments {
            for waypoint in &segment.points {
                points.push(TrackPoint {
                    lat: waypoint.point().y(),
                    lon: waypoint.point().x(),
                    elevation: waypoint.elevation,
                    time: waypoint.time.map(gpx_time_to_chrono),
                });
            }
        }
    }
    Ok(points)
}

fn chrono_to_gpx_time(time: DateTime<FixedOffset>) -> gpx::Time {
    let odt = time::OffsetDateTime::from_unix_timestamp(time.timestamp())
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    gpx::Time::from(odt)
}

pub(crate) fn gpx_time_to_chrono(time: gpx::Time) -> DateTime<FixedOffset> {
    let odt = time::OffsetDateTime::from(time);
    Utc.timestamp_opt(odt.unix_timestamp(), 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_nanos(0))
        .fixed_offset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ProviderKind, Sport};
    use tempdir::TempDir;

    fn activity_with_track() -> Activity {
        let offset = FixedOffset::east_opt(0).unwrap();
        let base = offset.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap();
        let track = (0..5)
            .map(|i| TrackPoint {
                lat: 52.52 + i as f64 * 0.001,
                lon: 13.405 + i as f64 * 0.002,
                elevation: Some(30.0 + i as f64),
                time: Some(base + chrono::Duration::seconds(i * 30)),
            })
            .collect();
        Activity {
            source: ProviderKind::Garmin,
            native_id: "77".to_string(),
            sport: Sport::Run,
            name: Some("Track Repeats".to_string()),
            start_time: base,
            duration_seconds: Some(150),
            distance_meters: Some(900.0),
            elevation_gain_meters: Some(4.0),
            average_heart_rate: None,
            average_speed: None,
            track,
        }
    }

    #[test]
    fn round_trips_coordinates_elevation_and_time() {
        let dir = TempDir::new("tracks").unwrap();
        let activity = activity_with_track();

        let path = export(dir.path(), &activity).unwrap().unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "garmin_77.gpx");

        let decoded = decode_gpx(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(decoded.len(), activity.track.len());
        for (original, decoded) in activity.track.iter().zip(&decoded) {
            assert!((original.lat - decoded.lat).abs() < 1e-6);
            assert!((original.lon - decoded.lon).abs() < 1e-6);
            assert!((original.elevation.unwrap() - decoded.elevation.unwrap()).abs() < 1e-6);
            assert_eq!(
                original.time.unwrap().timestamp(),
                decoded.time.unwrap().timestamp()
            );
        }
    }

    #[test]
    fn empty_track_writes_nothing() {
        let dir = TempDir::new("tracks").unwrap();
        let mut activity = activity_with_track();
        activity.track.clear();

        assert_eq!(export(dir.path(), &activity).unwrap(), None);
        assert!(!dir.path().join(TRACKS_DIR).exists());
    }
}
