//! The batch orchestrator. Providers run sequentially; within one
//! provider, page N+1 is fetched only after page N has been fully
//! normalized, merged, exported, and its cursor committed, so a crash
//! resumes from the last committed cursor rather than re-downloading
//! or corrupting history.

use crate::activity::ProviderKind;
use crate::aggregate;
use crate::error::SyncError;
use crate::normalize::normalize;
use crate::providers::ProviderClient;
use crate::store::{ActivityStore, CursorState, MergeResult};
use crate::track_export;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Upper bound on pages per provider per run, as a stop against a
/// provider whose cursor fails to advance.
const MAX_PAGES_PER_RUN: usize = 500;

/// Per-provider counts for the run report.
#[derive(Debug, Default, Clone)]
pub struct ProviderOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Set when the provider's sync was abandoned.
    pub abandoned: Option<String>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub providers: Vec<(ProviderKind, ProviderOutcome)>,
}

impl RunSummary {
    pub fn total_activities(&self) -> usize {
        self.providers
            .iter()
            .map(|(_, o)| o.inserted + o.updated + o.skipped)
            .sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (provider, outcome) in &self.providers {
            write!(
                f,
                "{provider}: {} inserted, {} updated, {} skipped, {} failed",
                outcome.inserted, outcome.updated, outcome.skipped, outcome.failed
            )?;
            if let Some(reason) = &outcome.abandoned {
                write!(f, " (abandoned: {reason})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub struct SyncJob {
    data_dir: PathBuf,
    clients: Vec<ProviderClient>,
}

impl SyncJob {
    pub fn new(data_dir: &Path, clients: Vec<ProviderClient>) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            clients,
        }
    }

    /// Run the full pipeline. Returns `Err` only when persistence
    /// itself failed; provider failures are reported in the summary
    /// and do not block other providers.
    pub async fn run(mut self) -> Result<RunSummary, SyncError> {
        let mut store = ActivityStore::open(&self.data_dir)?;
        let mut cursors = CursorState::open(&self.data_dir)?;
        let mut summary = RunSummary::default();

        for client in &mut self.clients {
            let kind = client.kind();
            let mut outcome = ProviderOutcome::default();

            match sync_provider(&self.data_dir, client, &mut store, &mut cursors, &mut outcome)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_fatal_to_run() => return Err(e),
                Err(e) => {
                    // Partial-failure policy: one provider's failure
                    // must not block the others.
                    error!("Abandoning {kind} sync: {e}");
                    outcome.abandoned = Some(e.to_string());
                }
            }
            summary.providers.push((kind, outcome));
        }

        let rows = aggregate::build(&store);
        aggregate::write(&self.data_dir, &rows).map_err(SyncError::Persistence)?;
        info!(
            "Aggregate rebuilt with {} activities across {} providers",
            rows.len(),
            summary.providers.len()
        );

        Ok(summary)
    }
}

async fn sync_provider(
    data_dir: &Path,
    client: &mut ProviderClient,
    store: &mut ActivityStore,
    cursors: &mut CursorState,
    outcome: &mut ProviderOutcome,
) -> Result<(), SyncError> {
    let kind = client.kind();
    info!("Syncing {kind}");
    client.authenticate().await?;

    let mut cursor = cursors.get(kind).map(str::to_string);
    for _ in 0..MAX_PAGES_PER_RUN {
        let page = client.fetch_page(cursor.as_deref()).await?;
        if page.raw.is_empty() && !page.more {
            break;
        }
        info!("{kind}: processing page of {} activities", page.raw.len());

        for raw in &page.raw {
            match normalize(raw) {
                Ok(activity) => {
                    let result = store.upsert(activity.clone());
                    match result {
                        MergeResult::Inserted => outcome.inserted += 1,
                        MergeResult::UpdatedInPlace => outcome.updated += 1,
                        MergeResult::UnchangedSkipped => outcome.skipped += 1,
                    }
                    // Unchanged activities keep their file mtimes so
                    // downstream caching stays warm.
                    if result != MergeResult::UnchangedSkipped {
                        if let Err(e) = track_export::export(data_dir, &activity) {
                            warn!("{e}");
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping record: {e}");
                    outcome.failed += 1;
                }
            }
        }

        // Commit point: the page is only considered synced once the
        // store hits disk, and the cursor only advances after that.
        store.save()?;
        if let Some(next) = page.next_cursor {
            cursors.set(kind, next.clone());
            cursors.save()?;
            cursor = Some(next);
        }
        if !page.more {
            break;
        }
    }

    info!(
        "{kind}: {} inserted, {} updated, {} skipped, {} failed",
        outcome.inserted, outcome.updated, outcome.skipped, outcome.failed
    );
    Ok(())
}

/// Regenerate every track file and the aggregate from the canonical
/// store alone. Derived data never feeds back into the store.
pub fn rebuild(data_dir: &Path) -> Result<usize, SyncError> {
    let store = ActivityStore::open(data_dir)?;
    let mut exported = 0;
    for activity in store.iter() {
        match track_export::export(data_dir, activity) {
            Ok(Some(_)) => exported += 1,
            Ok(None) => {}
            Err(e) => warn!("{e}"),
        }
    }
    let rows = aggregate::build(&store);
    aggregate::write(data_dir, &rows).map_err(SyncError::Persistence)?;
    info!(
        "Rebuilt {} track files and an aggregate of {} activities",
        exported,
        rows.len()
    );
    Ok(exported)
}
