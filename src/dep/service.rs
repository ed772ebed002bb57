//! The assigner pass

use super::reconciler::Reconciler;
use super::registrar::ProfileRegistrar;
use super::syncer::{DeviceSyncer, SyncOptions, SyncSummary};
use super::terms::TermsGate;
use super::{DepApi, DEP_NAME};
use crate::datastore::{Cursor, CursorStorage, Datastore};
use crate::metrics;
use crate::model::Team;
use crate::{Result, ResultExt};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Whether a stored cursor must be cleared because the effective profile
/// changed after it was stored
///
/// An empty cursor never needs a reset. An unknown profile time never
/// triggers one.
pub fn cursor_needs_reset(cursor: &Cursor, effective_modified_at: Option<DateTime<Utc>>) -> bool {
    !cursor.is_empty() && effective_modified_at > cursor.modified_at
}

/// Result of one [`DepService::run_assigner`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// The cursor was cleared before syncing
    pub cursor_reset: bool,
    pub pages: usize,
    pub devices_seen: usize,
    /// Non-fatal errors from page handling
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl RunSummary {
    fn new(cursor_reset: bool, sync: SyncSummary, duration: Duration) -> Self {
        Self {
            cursor_reset,
            pages: sync.pages(),
            devices_seen: sync.devices_seen,
            errors: sync.errors,
            duration,
        }
    }
}

/// Wires registrar, reconciler and syncer around one DEP client
///
/// The client is wrapped in a [`TermsGate`] so every DEP call keeps the
/// terms flag current.
pub struct DepService {
    store: Arc<dyn Datastore>,
    cursors: Arc<dyn CursorStorage>,
    registrar: Arc<ProfileRegistrar>,
    syncer: DeviceSyncer,
}

impl DepService {
    pub fn new(
        store: Arc<dyn Datastore>,
        cursors: Arc<dyn CursorStorage>,
        client: Arc<dyn DepApi>,
        options: SyncOptions,
    ) -> Self {
        let client: Arc<dyn DepApi> = Arc::new(TermsGate::new(client, store.clone()));
        let registrar = Arc::new(ProfileRegistrar::new(store.clone(), client.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            client.clone(),
            registrar.clone(),
        ));
        let syncer = DeviceSyncer::new(DEP_NAME, client, cursors.clone(), reconciler, options);

        Self {
            store,
            cursors,
            registrar,
            syncer,
        }
    }

    pub fn registrar(&self) -> &ProfileRegistrar {
        &self.registrar
    }

    /// Run one full assigner pass
    ///
    /// Passes must not overlap; callers serialize them (see
    /// [`crate::daemon::AssignerDaemon`]).
    pub async fn run_assigner(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let result = self.run_pass(started).await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_run(status, started.elapsed().as_secs_f64());
        result
    }

    async fn run_pass(&self, started: Instant) -> Result<RunSummary> {
        let app_config = self.store.app_config().await.context("fetching app config")?;

        let team = self
            .default_team(&app_config.mdm.apple_bm_default_team)
            .await?;

        let default = self
            .registrar
            .ensure_default_setup_assistant(team.as_ref())
            .await
            .context("ensure default setup assistant")?;

        let custom = self
            .registrar
            .ensure_custom_setup_assistant_if_exists(team.as_ref())
            .await
            .context("ensure custom setup assistant")?;

        let effective_modified_at = if custom.is_empty() {
            default.modified_at
        } else {
            custom.modified_at
        };

        let cursor = self
            .cursors
            .retrieve_cursor(DEP_NAME)
            .await
            .context("retrieve DEP cursor")?;
        let cursor_reset = cursor_needs_reset(&cursor, effective_modified_at);
        if cursor_reset {
            info!(
                cursor_modified_at = ?cursor.modified_at,
                profile_modified_at = ?effective_modified_at,
                "Profile changed since the cursor was stored, clearing device sync cursor"
            );
            self.cursors
                .store_cursor(DEP_NAME, "")
                .await
                .context("clear DEP cursor")?;
        }

        let sync = self.syncer.run().await?;
        let summary = RunSummary::new(cursor_reset, sync, started.elapsed());

        info!(
            cursor_reset = summary.cursor_reset,
            pages = summary.pages,
            devices = summary.devices_seen,
            errors = summary.errors.len(),
            duration_ms = summary.duration.as_millis() as u64,
            "Assigner pass finished"
        );
        Ok(summary)
    }

    /// The team DEP devices are placed into, if configured and still present
    async fn default_team(&self, name: &str) -> Result<Option<Team>> {
        if name.is_empty() {
            return Ok(None);
        }
        match self.store.team_by_name(name).await {
            Ok(team) => Ok(Some(team)),
            Err(e) if e.is_not_found() => {
                warn!(team = %name, "DEP default team not found, using no team");
                Ok(None)
            }
            Err(e) => Err(e.context("get DEP default team")),
        }
    }
}
