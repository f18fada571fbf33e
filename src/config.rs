//! Per-run provider configuration from the process environment. A
//! provider is enabled when its full credential set is present; the
//! assembled clients carry all per-run state, scoped to this run.

use crate::activity::ProviderKind;
use crate::providers::folder::{FolderClient, FolderConfig};
use crate::providers::garmin::{GarminClient, GarminConfig};
use crate::providers::keep::{KeepClient, KeepConfig};
use crate::providers::nike::{NikeClient, NikeConfig};
use crate::providers::strava::{StravaClient, StravaConfig};
use crate::providers::ProviderClient;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Build clients for every provider whose credentials are configured,
/// optionally restricted to an explicit selection.
pub fn clients_from_env(data_dir: &Path, only: &[ProviderKind]) -> Vec<ProviderClient> {
    let mut clients = Vec::new();

    let wanted = |kind: ProviderKind| only.is_empty() || only.contains(&kind);

    if wanted(ProviderKind::Strava) {
        match strava_from_env() {
            Some(config) => {
                clients.push(ProviderClient::Strava(StravaClient::new(config, data_dir)))
            }
            None => debug!("Strava not configured, skipping"),
        }
    }
    if wanted(ProviderKind::Garmin) {
        match garmin_from_env() {
            Some(config) => clients.push(ProviderClient::Garmin(GarminClient::new(config))),
            None => debug!("Garmin not configured, skipping"),
        }
    }
    if wanted(ProviderKind::Nike) {
        match nike_from_env() {
            Some(config) => clients.push(ProviderClient::Nike(NikeClient::new(config))),
            None => debug!("Nike not configured, skipping"),
        }
    }
    if wanted(ProviderKind::Keep) {
        match keep_from_env() {
            Some(config) => clients.push(ProviderClient::Keep(KeepClient::new(config, data_dir))),
            None => debug!("Keep not configured, skipping"),
        }
    }
    if wanted(ProviderKind::Folder) {
        match folder_from_env() {
            Some(config) => clients.push(ProviderClient::Folder(FolderClient::new(config))),
            None => debug!("Folder source not configured, skipping"),
        }
    }

    let enabled: Vec<String> = clients.iter().map(|c| c.kind().to_string()).collect();
    info!("Enabled providers: [{}]", enabled.join(", "));
    clients
}

fn strava_from_env() -> Option<StravaConfig> {
    Some(StravaConfig {
        client_id: env_nonempty("STRAVA_CLIENT_ID")?,
        client_secret: env_nonempty("STRAVA_CLIENT_SECRET")?,
        refresh_token: env_nonempty("STRAVA_REFRESH_TOKEN")?,
    })
}

fn garmin_from_env() -> Option<GarminConfig> {
    Some(GarminConfig {
        secret_token: env_nonempty("GARMIN_SECRET_TOKEN")?,
        is_cn: env_flag("GARMIN_IS_CN"),
    })
}

fn nike_from_env() -> Option<NikeConfig> {
    Some(NikeConfig {
        refresh_token: env_nonempty("NIKE_REFRESH_TOKEN")?,
    })
}

fn keep_from_env() -> Option<KeepConfig> {
    Some(KeepConfig {
        mobile: env_nonempty("KEEP_MOBILE")?,
        password: env_nonempty("KEEP_PASSWORD")?,
    })
}

fn folder_from_env() -> Option<FolderConfig> {
    Some(FolderConfig {
        dir: PathBuf::from(env_nonempty("TRACK_FOLDER")?),
    })
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_accepts_common_spellings() {
        // Distinct var names: the test environment is process-global.
        env::set_var("PACELINE_TEST_FLAG_ON", "True");
        env::set_var("PACELINE_TEST_FLAG_OFF", "0");
        assert!(env_flag("PACELINE_TEST_FLAG_ON"));
        assert!(!env_flag("PACELINE_TEST_FLAG_OFF"));
        assert!(!env_flag("PACELINE_TEST_FLAG_UNSET"));
    }

    #[test]
    fn empty_values_do_not_enable_a_provider() {
        env::set_var("PACELINE_TEST_EMPTY", "  ");
        assert_eq!(env_nonempty("PACELINE_TEST_EMPTY"), None);
    }
}
