//! The full-collection summary the static site renders from. A pure
//! fold over the canonical store: no dependency on prior aggregate
//! output, so it is always regenerable and always consistent.

use crate::activity::{Activity, ProviderKind, Sport, TrackPoint};
use crate::error::PersistenceError;
use crate::store::{ActivityStore, write_atomic};
use chrono::{DateTime, FixedOffset};
use geo::{Coord, LineString, Simplify};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const AGGREGATE_FILE: &str = "activities.json";

/// Douglas-Peucker tolerance in degrees, roughly 5 m at the equator.
/// Enough for a thumbnail map, small enough to keep the shape.
const SIMPLIFY_EPSILON_DEGREES: f64 = 0.00005;

/// One activity as the front end sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub id: String,
    pub source: ProviderKind,
    pub sport: Sport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub start_time: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation_gain_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_heart_rate: Option<f64>,
    /// Simplified track, Google polyline encoded, for lightweight
    /// rendering. Absent for indoor activities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_polyline: Option<String>,
}

/// Fold the whole store into summary rows, newest first.
pub fn build(store: &ActivityStore) -> Vec<SummaryRow> {
    let mut rows: Vec<SummaryRow> = store.iter().map(summarize).collect();
    rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    rows
}

pub fn write(data_dir: &Path, rows: &[SummaryRow]) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(rows)?;
    write_atomic(&data_dir.join(AGGREGATE_FILE), &bytes)
}

fn summarize(activity: &Activity) -> SummaryRow {
    SummaryRow {
        id: activity.identity(),
        source: activity.source,
        sport: activity.sport,
        name: activity.name.clone(),
        start_time: activity.start_time,
        distance_meters: activity.distance_meters,
        duration_seconds: activity.duration_seconds,
        elevation_gain_meters: activity.elevation_gain_meters,
        average_heart_rate: activity.average_heart_rate,
        summary_polyline: encode_simplified(&activity.track),
    }
}

fn encode_simplified(track: &[TrackPoint]) -> Option<String> {
    if track.len() < 2 {
        return None;
    }
    let line: LineString<f64> = track
        .iter()
        .map(|p| Coord { x: p.lon, y: p.lat })
        .collect();
    let simplified = line.simplify(&SIMPLIFY_EPSILON_DEGREES);
    polyline::encode_coordinates(simplified, 5).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ActivityStore;
    use chrono::TimeZone;
    use tempdir::TempDir;

    fn activity(native_id: &str, day: u32, track: Vec<TrackPoint>) -> Activity {
        let offset = FixedOffset::east_opt(0).unwrap();
        Activity {
            source: ProviderKind::Strava,
            native_id: native_id.to_string(),
            sport: Sport::Run,
            name: None,
            start_time: offset.with_ymd_and_hms(2024, 5, day, 8, 0, 0).unwrap(),
            duration_seconds: Some(1800),
            distance_meters: Some(5000.0),
            elevation_gain_meters: None,
            average_heart_rate: None,
            average_speed: None,
            track,
        }
    }

    #[test]
    fn rows_are_ordered_newest_first() {
        let dir = TempDir::new("agg").unwrap();
        let mut store = ActivityStore::open(dir.path()).unwrap();
        store.upsert(activity("old", 1, Vec::new()));
        store.upsert(activity("new", 20, Vec::new()));
        store.upsert(activity("mid", 10, Vec::new()));

        let rows = build(&store);
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["strava:new", "strava:mid", "strava:old"]);
    }

    #[test]
    fn polyline_present_only_with_geographic_data() {
        let dir = TempDir::new("agg").unwrap();
        let mut store = ActivityStore::open(dir.path()).unwrap();
        let track = vec![
            TrackPoint {
                lat: 52.52,
                lon: 13.405,
                elevation: None,
                time: None,
            },
            TrackPoint {
                lat: 52.53,
                lon: 13.415,
                elevation: None,
                time: None,
            },
        ];
        store.upsert(activity("outdoor", 1, track));
        store.upsert(activity("indoor", 2, Vec::new()));

        let rows = build(&store);
        assert_eq!(rows.len(), 2);
        assert!(rows[1].summary_polyline.is_some());
        assert!(rows[0].summary_polyline.is_none());
    }

    #[test]
    fn written_aggregate_parses_back() {
        let dir = TempDir::new("agg").unwrap();
        let mut store = ActivityStore::open(dir.path()).unwrap();
        store.upsert(activity("1", 1, Vec::new()));
        let rows = build(&store);
        write(dir.path(), &rows).unwrap();

        let bytes = std::fs::read(dir.path().join(AGGREGATE_FILE)).unwrap();
        let parsed: Vec<SummaryRow> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "strava:1");
    }
}
