//! Conversion of provider-native records into the canonical `Activity`
//! shape: sport-taxonomy mapping, metric units everywhere, and derived
//! metrics when a summary field is missing but the track can supply it.

use crate::activity::{Activity, ProviderKind, Sport, TrackPoint};
use crate::error::SyncError;
use crate::providers::RawActivity;
use crate::providers::folder::FolderActivity;
use crate::providers::garmin::GarminRaw;
use crate::providers::keep::KeepRaw;
use crate::providers::nike::NikeRaw;
use crate::providers::strava::StravaActivity;
use crate::track_export::decode_gpx;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

/// Consecutive elevation deltas at or below this are treated as GPS
/// noise and do not contribute to elevation gain.
pub const ELEVATION_NOISE_THRESHOLD_METERS: f64 = 1.0;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

pub fn normalize(raw: &RawActivity) -> Result<Activity, SyncError> {
    match raw {
        RawActivity::Strava(a) => normalize_strava(a),
        RawActivity::Garmin(a) => normalize_garmin(a),
        RawActivity::Nike(a) => normalize_nike(a),
        RawActivity::Keep(a) => normalize_keep(a),
        RawActivity::Folder(a) => normalize_folder(a),
    }
}

fn normalize_strava(a: &StravaActivity) -> Result<Activity, SyncError> {
    let provider = ProviderKind::Strava;
    let native_id = a.id.to_string();

    let utc_start = DateTime::parse_from_rfc3339(&a.start_date)
        .map_err(|e| SyncError::malformed(provider, &native_id, format!("bad start_date: {e}")))?;
    let offset = FixedOffset::east_opt(a.utc_offset.unwrap_or(0.0) as i32)
        .ok_or_else(|| SyncError::malformed(provider, &native_id, "utc_offset out of range"))?;
    let start_time = utc_start.with_timezone(&offset);

    let track = match a.map.as_ref().and_then(|m| m.summary_polyline.as_deref()) {
        Some(encoded) if !encoded.is_empty() => decode_summary_polyline(encoded)
            .map_err(|e| SyncError::malformed(provider, &native_id, e))?,
        _ => Vec::new(),
    };

    Ok(finalize(Activity {
        source: provider,
        native_id,
        sport: sport_from_strava(a.activity_type.as_deref().unwrap_or_default()),
        name: a.name.clone(),
        start_time,
        duration_seconds: a.moving_time.or(a.elapsed_time),
        distance_meters: positive(a.distance),
        elevation_gain_meters: positive(a.total_elevation_gain),
        average_heart_rate: positive(a.average_heartrate),
        average_speed: positive(a.average_speed),
        track,
    }))
}

fn normalize_garmin(raw: &GarminRaw) -> Result<Activity, SyncError> {
    let provider = ProviderKind::Garmin;
    let a = &raw.summary;
    let native_id = a.activity_id.to_string();

    // Garmin reports naive local and GMT timestamps; their difference
    // recovers the athlete's offset.
    let gmt = parse_garmin_naive(a.start_time_gmt.as_deref());
    let local = parse_garmin_naive(a.start_time_local.as_deref());
    let start_time = match (gmt, local) {
        (Some(gmt), Some(local)) => {
            let offset_seconds = (local - gmt).num_seconds();
            let offset = i32::try_from(offset_seconds)
                .ok()
                .and_then(FixedOffset::east_opt)
                .ok_or_else(|| {
                    SyncError::malformed(provider, &native_id, "implausible timezone offset")
                })?;
            offset.from_utc_datetime(&gmt)
        }
        (Some(gmt), None) => Utc.from_utc_datetime(&gmt).fixed_offset(),
        _ => {
            return Err(SyncError::malformed(provider, &native_id, "no start time"));
        }
    };

    let track = match &raw.gpx {
        Some(doc) => decode_gpx(doc.as_bytes())
            .map_err(|e| SyncError::malformed(provider, &native_id, e))?,
        None => Vec::new(),
    };

    Ok(finalize(Activity {
        source: provider,
        native_id,
        sport: sport_from_garmin(
            a.activity_type
                .as_ref()
                .map(|t| t.type_key.as_str())
                .unwrap_or_default(),
        ),
        name: a.activity_name.clone(),
        start_time,
        duration_seconds: a.duration.map(|s| s.round() as u64),
        distance_meters: positive(a.distance),
        elevation_gain_meters: positive(a.elevation_gain),
        average_heart_rate: positive(a.average_hr),
        average_speed: positive(a.average_speed),
        track,
    }))
}

fn normalize_nike(raw: &NikeRaw) -> Result<Activity, SyncError> {
    let provider = ProviderKind::Nike;
    let a = &raw.summary;

    let start_time = DateTime::<Utc>::from_timestamp_millis(a.start_epoch_ms)
        .ok_or_else(|| SyncError::malformed(provider, &a.id, "bad start_epoch_ms"))?
        .fixed_offset();

    let mut distance_meters = None;
    let mut elevation_gain_meters = None;
    let mut average_heart_rate = None;
    for summary in &a.summaries {
        match summary.metric.as_str() {
            // Nike reports distance in kilometers.
            "distance" => distance_meters = positive(Some(summary.value * 1000.0)),
            "ascent" => elevation_gain_meters = positive(Some(summary.value)),
            "heart_rate" => average_heart_rate = positive(Some(summary.value)),
            _ => {}
        }
    }

    let duration_seconds = a
        .active_duration_ms
        .or_else(|| a.end_epoch_ms.map(|end| end - a.start_epoch_ms))
        .filter(|ms| *ms > 0)
        .map(|ms| (ms as f64 / 1000.0).round() as u64);

    Ok(finalize(Activity {
        source: provider,
        native_id: a.id.clone(),
        sport: sport_from_nike(a.activity_type.as_deref().unwrap_or_default()),
        name: None,
        start_time,
        duration_seconds,
        distance_meters,
        elevation_gain_meters,
        average_heart_rate,
        average_speed: None,
        track: raw.track.clone(),
    }))
}

fn normalize_keep(raw: &KeepRaw) -> Result<Activity, SyncError> {
    let provider = ProviderKind::Keep;
    let a = &raw.summary;

    let start_ms = a
        .start_time
        .ok_or_else(|| SyncError::malformed(provider, &a.id, "no start time"))?;
    let offset = a
        .timezone_offset
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix());
    let start_time = DateTime::<Utc>::from_timestamp_millis(start_ms)
        .ok_or_else(|| SyncError::malformed(provider, &a.id, "bad start time"))?
        .with_timezone(&offset);

    Ok(finalize(Activity {
        source: provider,
        native_id: a.id.clone(),
        sport: sport_from_keep(a.sport_type.as_deref().unwrap_or("running")),
        name: a.name.clone(),
        start_time,
        duration_seconds: a.duration.filter(|s| *s > 0.0).map(|s| s.round() as u64),
        distance_meters: positive(a.distance),
        elevation_gain_meters: None,
        average_heart_rate: positive(a.average_heart_rate),
        average_speed: None,
        track: raw.track.clone(),
    }))
}

fn normalize_folder(a: &FolderActivity) -> Result<Activity, SyncError> {
    let provider = ProviderKind::Folder;
    let start_time = a
        .start_time
        .ok_or_else(|| SyncError::malformed(provider, &a.native_id, "no timestamps in file"))?;

    Ok(finalize(Activity {
        source: provider,
        native_id: a.native_id.clone(),
        sport: sport_from_code(a.sport_hint.as_deref().unwrap_or_default()),
        name: a.name.clone(),
        start_time,
        duration_seconds: a.duration_seconds,
        distance_meters: positive(a.distance_meters),
        elevation_gain_meters: None,
        average_heart_rate: positive(a.average_heart_rate),
        average_speed: positive(a.average_speed),
        track: a.track.clone(),
    }))
}

/// Fill metrics the source left out but the track can supply, then
/// derive average speed when both inputs are known.
fn finalize(mut activity: Activity) -> Activity {
    if activity.distance_meters.is_none() && activity.track.len() >= 2 {
        activity.distance_meters = Some(track_distance_meters(&activity.track));
    }
    if activity.elevation_gain_meters.is_none() {
        activity.elevation_gain_meters = elevation_gain_meters(&activity.track);
    }
    if activity.average_speed.is_none() {
        if let (Some(distance), Some(duration)) =
            (activity.distance_meters, activity.duration_seconds)
        {
            if duration > 0 {
                activity.average_speed = Some(distance / duration as f64);
            }
        }
    }
    activity
}

/// Haversine accumulation over consecutive track points.
pub fn track_distance_meters(track: &[TrackPoint]) -> f64 {
    track
        .windows(2)
        .map(|pair| haversine_meters(&pair[0], &pair[1]))
        .sum()
}

/// Sum of positive consecutive elevation deltas above the noise
/// threshold; `None` when the track carries no usable elevation.
pub fn elevation_gain_meters(track: &[TrackPoint]) -> Option<f64> {
    let elevations: Vec<f64> = track.iter().filter_map(|p| p.elevation).collect();
    if elevations.len() < 2 {
        return None;
    }
    let gain = elevations
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|delta| *delta > ELEVATION_NOISE_THRESHOLD_METERS)
        .sum();
    Some(gain)
}

fn haversine_meters(a: &TrackPoint, b: &TrackPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

fn decode_summary_polyline(encoded: &str) -> Result<Vec<TrackPoint>, String> {
    let line = polyline::decode_polyline(encoded, 5).map_err(|e| e.to_string())?;
    Ok(line
        .coords()
        .map(|c| TrackPoint {
            lat: c.y,
            lon: c.x,
            elevation: None,
            time: None,
        })
        .collect())
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

fn parse_garmin_naive(value: Option<&str>) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value?, "%Y-%m-%d %H:%M:%S").ok()
}

fn sport_from_strava(code: &str) -> Sport {
    match code {
        "Run" | "TrailRun" | "VirtualRun" => Sport::Run,
        "Ride" | "VirtualRide" | "GravelRide" | "MountainBikeRide" | "EBikeRide" => Sport::Ride,
        "Hike" => Sport::Hike,
        "Walk" => Sport::Walk,
        "Swim" => Sport::Swim,
        "Rowing" | "VirtualRow" => Sport::Row,
        "AlpineSki" | "BackcountrySki" | "NordicSki" => Sport::Ski,
        "Workout" | "WeightTraining" | "Crossfit" | "Yoga" | "Elliptical" => Sport::Workout,
        _ => Sport::Other,
    }
}

fn sport_from_garmin(type_key: &str) -> Sport {
    match type_key {
        "running" | "trail_running" | "treadmill_running" | "track_running" => Sport::Run,
        "cycling" | "road_biking" | "mountain_biking" | "gravel_cycling" | "virtual_ride"
        | "indoor_cycling" => Sport::Ride,
        "hiking" => Sport::Hike,
        "walking" | "casual_walking" => Sport::Walk,
        "lap_swimming" | "open_water_swimming" => Sport::Swim,
        "rowing" | "indoor_rowing" => Sport::Row,
        "resort_skiing_snowboarding" | "backcountry_skiing_snowboarding"
        | "cross_country_skiing" => Sport::Ski,
        "strength_training" | "fitness_equipment" | "yoga" | "indoor_cardio" => Sport::Workout,
        _ => Sport::Other,
    }
}

fn sport_from_nike(code: &str) -> Sport {
    match code {
        "run" | "jogging" => Sport::Run,
        "ride" | "cycle" => Sport::Ride,
        "walk" => Sport::Walk,
        "training" => Sport::Workout,
        _ => Sport::Other,
    }
}

fn sport_from_keep(code: &str) -> Sport {
    match code {
        "running" => Sport::Run,
        "cycling" => Sport::Ride,
        "hiking" => Sport::Hike,
        "walking" => Sport::Walk,
        _ => Sport::Other,
    }
}

/// Lenient mapping for file-based sources, which carry free-form sport
/// strings from whatever device wrote them.
fn sport_from_code(code: &str) -> Sport {
    let code = code.to_ascii_lowercase();
    match code.as_str() {
        c if c.contains("run") => Sport::Run,
        c if c.contains("bik") || c.contains("cycl") || c.contains("ride") => Sport::Ride,
        c if c.contains("hik") => Sport::Hike,
        c if c.contains("walk") => Sport::Walk,
        c if c.contains("swim") => Sport::Swim,
        c if c.contains("row") => Sport::Row,
        c if c.contains("ski") => Sport::Ski,
        _ => Sport::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::garmin::{GarminActivity, GarminActivityType};

    fn point(lat: f64, lon: f64, elevation: Option<f64>) -> TrackPoint {
        TrackPoint {
            lat,
            lon,
            elevation,
            time: None,
        }
    }

    #[test]
    fn elevation_gain_sums_positive_deltas_above_noise() {
        // Deltas: +5, -2, +0.5 (noise), +3 => gain = 8.
        let track = vec![
            point(0.0, 0.0, Some(100.0)),
            point(0.0, 0.001, Some(105.0)),
            point(0.0, 0.002, Some(103.0)),
            point(0.0, 0.003, Some(103.5)),
            point(0.0, 0.004, Some(106.5)),
        ];
        assert_eq!(elevation_gain_meters(&track), Some(8.0));
    }

    #[test]
    fn elevation_gain_is_unknown_without_elevation_samples() {
        let track = vec![point(0.0, 0.0, None), point(0.0, 0.001, None)];
        assert_eq!(elevation_gain_meters(&track), None);
    }

    #[test]
    fn track_distance_is_plausible() {
        // One degree of longitude at the equator is ~111 km.
        let track = vec![point(0.0, 0.0, None), point(0.0, 1.0, None)];
        let distance = track_distance_meters(&track);
        assert!((distance - 111_195.0).abs() < 100.0, "got {distance}");
    }

    #[test]
    fn strava_record_normalizes_with_local_offset() {
        let json = r#"{
            "id": 987,
            "name": "Lunch Ride",
            "type": "Ride",
            "start_date": "2024-05-01T10:00:00Z",
            "utc_offset": 7200.0,
            "distance": 25000.0,
            "moving_time": 3600,
            "elapsed_time": 3700,
            "total_elevation_gain": 240.0,
            "average_heartrate": 141.5,
            "average_speed": 6.9,
            "map": {"summary_polyline": "_p~iF~ps|U_ulLnnqC"}
        }"#;
        let raw: StravaActivity = serde_json::from_str(json).unwrap();
        let activity = normalize(&RawActivity::Strava(raw)).unwrap();

        assert_eq!(activity.native_id, "987");
        assert_eq!(activity.sport, Sport::Ride);
        assert_eq!(activity.start_time.offset().local_minus_utc(), 7200);
        // Same instant, local representation.
        assert_eq!(activity.start_time.to_rfc3339(), "2024-05-01T12:00:00+02:00");
        assert_eq!(activity.distance_meters, Some(25000.0));
        assert_eq!(activity.duration_seconds, Some(3600));
        assert_eq!(activity.track.len(), 2);
    }

    #[test]
    fn strava_unknown_sport_maps_to_other() {
        assert_eq!(sport_from_strava("Windsurf"), Sport::Other);
        assert_eq!(sport_from_garmin("sky_diving"), Sport::Other);
    }

    #[test]
    fn strava_zero_distance_stays_unknown() {
        let json = r#"{
            "id": 1,
            "type": "Workout",
            "start_date": "2024-05-01T10:00:00Z",
            "distance": 0.0,
            "elapsed_time": 1200
        }"#;
        let raw: StravaActivity = serde_json::from_str(json).unwrap();
        let activity = normalize(&RawActivity::Strava(raw)).unwrap();
        assert_eq!(activity.distance_meters, None);
        assert_eq!(activity.average_speed, None);
    }

    #[test]
    fn nike_distance_converts_kilometers_to_meters() {
        let json = r#"{
            "id": "abc",
            "type": "run",
            "start_epoch_ms": 1714557600000,
            "active_duration_ms": 1800000,
            "summaries": [{"metric": "distance", "value": 5.2}]
        }"#;
        let summary: crate::providers::nike::NikeActivity = serde_json::from_str(json).unwrap();
        let activity = normalize(&RawActivity::Nike(NikeRaw {
            summary,
            track: Vec::new(),
        }))
        .unwrap();
        assert_eq!(activity.sport, Sport::Run);
        assert_eq!(activity.distance_meters, Some(5200.0));
        assert_eq!(activity.duration_seconds, Some(1800));
        // Derived: 5200 m over 1800 s.
        assert!((activity.average_speed.unwrap() - 2.888).abs() < 0.01);
    }

    #[test]
    fn garmin_offset_recovered_from_local_and_gmt() {
        let raw = GarminRaw {
            summary: GarminActivity {
                activity_id: 5,
                activity_name: None,
                activity_type: Some(GarminActivityType {
                    type_key: "running".to_string(),
                }),
                start_time_local: Some("2024-05-01 16:00:00".to_string()),
                start_time_gmt: Some("2024-05-01 08:00:00".to_string()),
                distance: Some(10000.0),
                duration: Some(3000.4),
                elevation_gain: Some(50.0),
                average_hr: None,
                average_speed: None,
            },
            gpx: None,
        };
        let activity = normalize(&RawActivity::Garmin(raw)).unwrap();
        assert_eq!(activity.start_time.offset().local_minus_utc(), 8 * 3600);
        assert_eq!(activity.duration_seconds, Some(3000));
        assert_eq!(activity.sport, Sport::Run);
    }

    #[test]
    fn garmin_without_any_start_time_is_malformed() {
        let raw = GarminRaw {
            summary: GarminActivity {
                activity_id: 6,
                activity_name: None,
                activity_type: None,
                start_time_local: None,
                start_time_gmt: None,
                distance: None,
                duration: None,
                elevation_gain: None,
                average_hr: None,
                average_speed: None,
            },
            gpx: None,
        };
        assert!(matches!(
            normalize(&RawActivity::Garmin(raw)),
            Err(SyncError::Malformed { .. })
        ));
    }

    #[test]
    fn distance_derived_from_track_when_summary_missing() {
        let raw = FolderActivity {
            native_id: "t1".to_string(),
            sport_hint: Some("running".to_string()),
            name: None,
            start_time: Some(
                DateTime::parse_from_rfc3339("2024-05-01T18:00:00+00:00").unwrap(),
            ),
            duration_seconds: Some(600),
            distance_meters: None,
            average_heart_rate: None,
            average_speed: None,
            track: vec![point(0.0, 0.0, None), point(0.0, 0.01, None)],
        };
        let activity = normalize(&RawActivity::Folder(raw)).unwrap();
        let distance = activity.distance_meters.unwrap();
        assert!((distance - 1112.0).abs() < 5.0, "got {distance}");
        assert_eq!(activity.sport, Sport::Run);
    }
}
