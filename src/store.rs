use crate::activity::{Activity, ProviderKind};
use crate::error::PersistenceError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Opaque per-provider pagination marker. Only the provider that wrote
/// it knows how to interpret it.
pub type SyncCursor = String;

pub const STORE_FILE: &str = "store.json";
pub const CURSORS_FILE: &str = "cursors.json";

/// Outcome of merging one activity into the canonical collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    Inserted,
    UpdatedInPlace,
    UnchangedSkipped,
}

/// Write `bytes` to `path` via a temporary sibling and an atomic rename,
/// so readers never observe a truncated or duplicated file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    last_updated: String,
    activities: BTreeMap<String, Activity>,
}

/// The persisted canonical collection, keyed by activity identity.
///
/// Lookups and writes are order-independent: activities may arrive in
/// any order across providers and pages.
pub struct ActivityStore {
    path: PathBuf,
    activities: BTreeMap<String, Activity>,
}

impl ActivityStore {
    pub fn open(data_dir: &Path) -> Result<Self, PersistenceError> {
        let path = data_dir.join(STORE_FILE);
        let activities = match fs::read(&path) {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                info!(
                    "Loaded canonical store with {} activities",
                    file.activities.len()
                );
                file.activities
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No existing store at {}, starting fresh", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, activities })
    }

    /// Insert, update in place, or skip based on the content fingerprint.
    pub fn upsert(&mut self, activity: Activity) -> MergeResult {
        let key = activity.identity();
        match self.activities.get(&key) {
            None => {
                self.activities.insert(key, activity);
                MergeResult::Inserted
            }
            Some(existing) if existing.fingerprint() == activity.fingerprint() => {
                MergeResult::UnchangedSkipped
            }
            Some(_) => {
                self.activities.insert(key, activity);
                MergeResult::UpdatedInPlace
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<&Activity> {
        self.activities.get(identity)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }

    pub fn save(&self) -> Result<(), PersistenceError> {
        let file = StoreFile {
            last_updated: Utc::now().to_rfc3339(),
            activities: self.activities.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &bytes)
    }
}

/// Per-provider sync cursors, read at run start and rewritten only after
/// a page has been fully merged and committed.
pub struct CursorState {
    path: PathBuf,
    cursors: BTreeMap<String, SyncCursor>,
}

impl CursorState {
    pub fn open(data_dir: &Path) -> Result<Self, PersistenceError> {
        let path = data_dir.join(CURSORS_FILE);
        let cursors = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, cursors })
    }

    pub fn get(&self, provider: ProviderKind) -> Option<&str> {
        self.cursors.get(provider.as_str()).map(String::as_str)
    }

    pub fn set(&mut self, provider: ProviderKind, cursor: SyncCursor) {
        self.cursors.insert(provider.as_str().to_string(), cursor);
    }

    pub fn save(&self) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(&self.cursors)?;
        write_atomic(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Sport, TrackPoint};
    use chrono::{FixedOffset, TimeZone};
    use tempdir::TempDir;

    fn activity(native_id: &str, distance: f64) -> Activity {
        let offset = FixedOffset::east_opt(0).unwrap();
        Activity {
            source: ProviderKind::Strava,
            native_id: native_id.to_string(),
            sport: Sport::Run,
            name: None,
            start_time: offset.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            duration_seconds: Some(1800),
            distance_meters: Some(distance),
            elevation_gain_meters: None,
            average_heart_rate: None,
            average_speed: None,
            track: vec![TrackPoint {
                lat: 52.52,
                lon: 13.405,
                elevation: None,
                time: None,
            }],
        }
    }

    #[test]
    fn upsert_inserts_then_skips_then_updates() {
        let dir = TempDir::new("store").unwrap();
        let mut store = ActivityStore::open(dir.path()).unwrap();

        assert_eq!(store.upsert(activity("1", 5000.0)), MergeResult::Inserted);
        assert_eq!(
            store.upsert(activity("1", 5000.0)),
            MergeResult::UnchangedSkipped
        );
        assert_eq!(
            store.upsert(activity("1", 5100.0)),
            MergeResult::UpdatedInPlace
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn identities_stay_unique_across_reloads() {
        let dir = TempDir::new("store").unwrap();
        {
            let mut store = ActivityStore::open(dir.path()).unwrap();
            store.upsert(activity("1", 5000.0));
            store.upsert(activity("2", 8000.0));
            store.save().unwrap();
        }
        let mut store = ActivityStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        // Re-syncing the same records must not duplicate them.
        assert_eq!(
            store.upsert(activity("1", 5000.0)),
            MergeResult::UnchangedSkipped
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn save_leaves_no_temporary_file_behind() {
        let dir = TempDir::new("store").unwrap();
        let mut store = ActivityStore::open(dir.path()).unwrap();
        store.upsert(activity("1", 5000.0));
        store.save().unwrap();
        store.save().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STORE_FILE.to_string()]);
    }

    #[test]
    fn cursors_round_trip() {
        let dir = TempDir::new("cursors").unwrap();
        {
            let mut cursors = CursorState::open(dir.path()).unwrap();
            cursors.set(ProviderKind::Strava, "1714550400".to_string());
            cursors.save().unwrap();
        }
        let cursors = CursorState::open(dir.path()).unwrap();
        assert_eq!(cursors.get(ProviderKind::Strava), Some("1714550400"));
        assert_eq!(cursors.get(ProviderKind::Garmin), None);
    }
}
