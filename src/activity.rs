use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// The services activities can come from. Adding a provider means adding
/// a variant here plus a client and a normalization arm, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Strava,
    Garmin,
    Nike,
    Keep,
    Folder,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Strava => "strava",
            ProviderKind::Garmin => "garmin",
            ProviderKind::Nike => "nike",
            ProviderKind::Keep => "keep",
            ProviderKind::Folder => "folder",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strava" => Ok(ProviderKind::Strava),
            "garmin" => Ok(ProviderKind::Garmin),
            "nike" => Ok(ProviderKind::Nike),
            "keep" => Ok(ProviderKind::Keep),
            "folder" => Ok(ProviderKind::Folder),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Canonical sport categories. Providers keep inventing new sport codes,
/// so anything unrecognized maps to `Other` instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Run,
    Ride,
    Hike,
    Walk,
    Swim,
    Row,
    Ski,
    Workout,
    Other,
}

impl Sport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Run => "run",
            Sport::Ride => "ride",
            Sport::Hike => "hike",
            Sport::Walk => "walk",
            Sport::Swim => "swim",
            Sport::Row => "row",
            Sport::Ski => "ski",
            Sport::Workout => "workout",
            Sport::Other => "other",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample of an activity's geographic track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<FixedOffset>>,
}

/// The canonical, provider-independent representation of one workout.
///
/// Absent metrics stay `None` rather than being coerced to zero, and an
/// empty `track` is a valid state (indoor activities), not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub source: ProviderKind,
    pub native_id: String,
    pub sport: Sport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Start time with the offset the source reported. Kept as-is so
    /// calendar-day bucketing downstream matches the athlete's local day.
    pub start_time: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation_gain_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_heart_rate: Option<f64>,
    /// Meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_speed: Option<f64>,
    #[serde(default)]
    pub track: Vec<TrackPoint>,
}

impl Activity {
    /// The merge key: provider plus provider-native id. Never derived
    /// from content, so edits at the source update in place instead of
    /// duplicating.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.source, self.native_id)
    }

    /// SHA-256 over all mutable fields. The store compares fingerprints
    /// to decide between an in-place update and an unchanged skip.
    ///
    /// Every optional field is hashed with a presence byte, so a metric
    /// moving between fields, or an empty name replacing an absent one,
    /// changes the digest.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_str().as_bytes());
        hasher.update(self.native_id.as_bytes());
        hasher.update(self.sport.as_str().as_bytes());
        hash_opt_str(&mut hasher, self.name.as_deref());
        hasher.update(self.start_time.to_rfc3339().as_bytes());
        hash_opt_bytes(&mut hasher, self.duration_seconds.map(u64::to_le_bytes));
        for metric in [
            self.distance_meters,
            self.elevation_gain_meters,
            self.average_heart_rate,
            self.average_speed,
        ] {
            hash_opt_f64(&mut hasher, metric);
        }
        hasher.update((self.track.len() as u64).to_le_bytes());
        for point in &self.track {
            hasher.update(point.lat.to_bits().to_le_bytes());
            hasher.update(point.lon.to_bits().to_le_bytes());
            hash_opt_f64(&mut hasher, point.elevation);
            hash_opt_bytes(
                &mut hasher,
                point.time.map(|t| t.timestamp().to_le_bytes()),
            );
        }
        format!("{:x}", hasher.finalize())
    }
}

fn hash_opt_f64(hasher: &mut Sha256, value: Option<f64>) {
    hash_opt_bytes(hasher, value.map(|v| v.to_bits().to_le_bytes()));
}

fn hash_opt_bytes<const N: usize>(hasher: &mut Sha256, value: Option<[u8; N]>) {
    match value {
        Some(bytes) => {
            hasher.update([1]);
            hasher.update(bytes);
        }
        None => hasher.update([0]),
    }
}

fn hash_opt_str(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(s) => {
            hasher.update([1]);
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        None => hasher.update([0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Activity {
        let offset = FixedOffset::east_opt(3600).unwrap();
        Activity {
            source: ProviderKind::Strava,
            native_id: "42".to_string(),
            sport: Sport::Run,
            name: Some("Morning Run".to_string()),
            start_time: offset.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
            duration_seconds: Some(1800),
            distance_meters: Some(5000.0),
            elevation_gain_meters: None,
            average_heart_rate: Some(150.0),
            average_speed: None,
            track: vec![TrackPoint {
                lat: 52.52,
                lon: 13.405,
                elevation: Some(34.0),
                time: None,
            }],
        }
    }

    #[test]
    fn identity_combines_provider_and_native_id() {
        assert_eq!(sample().identity(), "strava:42");
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
    }

    #[test]
    fn fingerprint_changes_when_a_metric_changes() {
        let a = sample();
        let mut b = sample();
        b.distance_meters = Some(5100.0);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_which_metric_is_set() {
        let mut a = sample();
        a.distance_meters = Some(42.0);
        a.elevation_gain_meters = None;
        a.average_heart_rate = None;
        a.average_speed = None;

        // Same value, different field.
        let mut b = sample();
        b.distance_meters = None;
        b.elevation_gain_meters = Some(42.0);
        b.average_heart_rate = None;
        b.average_speed = None;

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_empty_name_from_absent() {
        let mut a = sample();
        a.name = Some(String::new());
        let mut b = sample();
        b.name = None;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_when_track_changes() {
        let a = sample();
        let mut b = sample();
        b.track.push(TrackPoint {
            lat: 52.53,
            lon: 13.41,
            elevation: None,
            time: None,
        });
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn provider_kind_round_trips_through_str() {
        for kind in [
            ProviderKind::Strava,
            ProviderKind::Garmin,
            ProviderKind::Nike,
            ProviderKind::Keep,
            ProviderKind::Folder,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
    }
}
