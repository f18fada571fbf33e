use crate::activity::ProviderKind;

/// Everything that can go wrong during a sync run.
///
/// The taxonomy encodes the blast radius of each failure: per-record
/// errors are skipped, per-provider errors abandon that provider,
/// persistence errors abort the whole run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{provider}: authentication failed: {reason}")]
    Auth {
        provider: ProviderKind,
        reason: String,
    },

    #[error("{provider}: rate limited, retries exhausted")]
    RateLimitExceeded { provider: ProviderKind },

    #[error("{provider}: malformed record {native_id}: {reason}")]
    Malformed {
        provider: ProviderKind,
        native_id: String,
        reason: String,
    },

    #[error("{provider}: request failed: {reason}")]
    Network {
        provider: ProviderKind,
        reason: String,
    },

    #[error("{provider}: HTTP {status}")]
    Http {
        provider: ProviderKind,
        status: reqwest::StatusCode,
    },

    #[error("track encoding for {id} failed: {reason}")]
    TrackEncoding { id: String, reason: String },

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Failures of the canonical store, cursor state, or aggregate output.
/// Always fatal to the run; the on-disk files stay in their
/// last-known-good state because every write is an atomic rename.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn auth(provider: ProviderKind, reason: impl Into<String>) -> Self {
        SyncError::Auth {
            provider,
            reason: reason.into(),
        }
    }

    pub(crate) fn network(provider: ProviderKind, err: impl std::fmt::Display) -> Self {
        SyncError::Network {
            provider,
            reason: err.to_string(),
        }
    }

    pub(crate) fn malformed(
        provider: ProviderKind,
        native_id: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        SyncError::Malformed {
            provider,
            native_id: native_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Only persistence failures abort the whole run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, SyncError::Persistence(_))
    }
}
