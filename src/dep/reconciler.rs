//! Per-page device reconciliation

use super::registrar::ProfileRegistrar;
use super::syncer::PageHandler;
use super::DepApi;
use crate::datastore::Datastore;
use crate::metrics;
use crate::model::Team;
use crate::{Result, ResultExt};
use async_trait::async_trait;
use depapi::{Device, DeviceResponse};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Devices of one page, split by what happened to them
///
/// Every device of the page lands in exactly one bucket.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// `added` events, and events with no op_type (first full fetch)
    pub added: Vec<Device>,
    /// `modified` events for devices that are known hosts
    pub modified: Vec<Device>,
    /// `modified` events for devices never seen before, treated as added
    pub reclassified: Vec<Device>,
    pub deleted: Vec<Device>,
    /// Unrecognized op_type; never stored or assigned
    pub dropped: Vec<Device>,
}

impl Classification {
    /// Move modified devices that are not in `existing` to `reclassified`
    pub fn reclassify_unknown(&mut self, existing: &HashSet<String>) {
        let (known, unknown): (Vec<Device>, Vec<Device>) = std::mem::take(&mut self.modified)
            .into_iter()
            .partition(|d| existing.contains(&d.serial_number));
        self.modified = known;
        self.reclassified.extend(unknown);
    }

    /// Devices to ingest and assign: added, then reclassified
    pub fn to_add(&self) -> Vec<Device> {
        self.added
            .iter()
            .chain(&self.reclassified)
            .cloned()
            .collect()
    }

    pub fn modified_serials(&self) -> Vec<String> {
        serials(&self.modified)
    }

    pub fn deleted_serials(&self) -> Vec<String> {
        serials(&self.deleted)
    }

    pub fn len(&self) -> usize {
        self.added.len()
            + self.modified.len()
            + self.reclassified.len()
            + self.deleted.len()
            + self.dropped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn serials(devices: &[Device]) -> Vec<String> {
    devices.iter().map(|d| d.serial_number.clone()).collect()
}

/// Split devices by their (case-insensitive) op_type
pub fn classify_devices(devices: &[Device]) -> Classification {
    let mut classification = Classification::default();
    for device in devices {
        match device.op_type.to_lowercase().as_str() {
            "added" | "" => classification.added.push(device.clone()),
            "modified" => classification.modified.push(device.clone()),
            "deleted" => classification.deleted.push(device.clone()),
            _ => classification.dropped.push(device.clone()),
        }
    }
    classification
}

/// Aggregate per-device assignment results into
/// `success | not_accessible | failed | other`. Empty buckets are omitted.
pub fn count_results(results: &HashMap<String, String>) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for result in results.values() {
        let bucket = match result.to_lowercase().as_str() {
            "success" => "success",
            "not_accessible" => "not_accessible",
            "failed" => "failed",
            _ => "other",
        };
        *counts.entry(bucket).or_insert(0) += 1;
    }
    counts
}

/// What processing one page did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub modified: usize,
    pub reclassified: usize,
    pub deleted: usize,
    pub dropped: usize,
    /// Hosts created by ingestion
    pub ingested: usize,
    /// Team the added devices were ingested into
    pub team_id: Option<u32>,
    /// Profile the added devices were assigned (None = no assignment made)
    pub profile_uuid: Option<String>,
    pub results: BTreeMap<&'static str, usize>,
    /// Non-fatal failures (ingestion)
    pub errors: Vec<String>,
}

/// Applies DEP device events to the datastore and assigns the enrollment
/// profile to newly seen devices
pub struct Reconciler {
    store: Arc<dyn Datastore>,
    client: Arc<dyn DepApi>,
    registrar: Arc<ProfileRegistrar>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Datastore>,
        client: Arc<dyn DepApi>,
        registrar: Arc<ProfileRegistrar>,
    ) -> Self {
        Self {
            store,
            client,
            registrar,
        }
    }

    /// Reconcile one page of device events
    ///
    /// Deletions are applied before ingestion. An ingestion failure is logged
    /// and recorded in the outcome; an assignment failure is returned.
    pub async fn process_device_response(&self, resp: &DeviceResponse) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        if resp.devices.is_empty() {
            return Ok(outcome);
        }

        for device in &resp.devices {
            debug!(
                serial_number = %device.serial_number,
                device_assigned_by = %device.device_assigned_by,
                device_assigned_date = ?device.device_assigned_date,
                op_date = ?device.op_date,
                op_type = %device.op_type,
                profile_assign_time = ?device.profile_assign_time,
                profile_push_time = ?device.profile_push_time,
                profile_uuid = %device.profile_uuid,
                "device"
            );
        }

        let mut classification = classify_devices(&resp.devices);
        for device in &classification.dropped {
            warn!(
                op_type = %device.op_type,
                serial_number = %device.serial_number,
                "Unrecognized op_type"
            );
        }

        if !classification.modified.is_empty() {
            let existing = self
                .store
                .matching_host_serials(&classification.modified_serials())
                .await
                .context("get matching host serials")?;
            classification.reclassify_unknown(&existing);
        }

        outcome.added = classification.added.len();
        outcome.modified = classification.modified.len();
        outcome.reclassified = classification.reclassified.len();
        outcome.deleted = classification.deleted.len();
        outcome.dropped = classification.dropped.len();
        metrics::record_device_events("added", outcome.added);
        metrics::record_device_events("modified", outcome.modified);
        metrics::record_device_events("reclassified", outcome.reclassified);
        metrics::record_device_events("deleted", outcome.deleted);
        metrics::record_device_events("dropped", outcome.dropped);

        if !classification.deleted.is_empty() {
            self.store
                .delete_host_dep_assignments(&classification.deleted_serials())
                .await
                .context("deleting DEP assignments")?;
        }

        let to_add = classification.to_add();
        if !to_add.is_empty() {
            match self.store.ingest_devices_from_dep_sync(&to_add).await {
                Ok((n, team_id)) => {
                    outcome.ingested = n;
                    outcome.team_id = team_id;
                    if n > 0 {
                        info!("Added {} new mdm device(s) to pending hosts", n);
                    } else {
                        info!("No DEP hosts to add");
                    }
                }
                Err(e) => {
                    error!(error = %e, devices = to_add.len(), "Failed to ingest DEP devices");
                    metrics::record_ingest_error();
                    outcome.errors.push(format!("ingest DEP devices: {}", e));
                }
            }
        }

        // Hosts now carry their team, which decides the profile
        let team = match outcome.team_id {
            Some(id) => match self.store.team(id).await {
                Ok(team) => Some(team),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.context("get team")),
            },
            None => None,
        };

        let profile_uuid = self.resolve_profile_uuid(team.as_ref()).await?;
        if profile_uuid.is_empty() {
            debug!("Empty assigner profile UUID");
            return Ok(outcome);
        }

        if to_add.is_empty() {
            debug!(
                profile_uuid = %profile_uuid,
                devices = resp.devices.len(),
                "No serials to assign"
            );
            return Ok(outcome);
        }

        let assign_serials = serials(&to_add);
        let response = match self.client.assign_profile(&profile_uuid, &assign_serials).await {
            Ok(response) => response,
            Err(e) => {
                info!(
                    profile_uuid = %profile_uuid,
                    devices = assign_serials.len(),
                    error = %e,
                    "Assign profile failed"
                );
                return Err(crate::AssignerError::from(e).context("assign profile"));
            }
        };

        let results = count_results(&response.devices);
        metrics::record_assign_results(&results);
        info!(
            profile_uuid = %profile_uuid,
            devices = assign_serials.len(),
            results = ?results,
            "Profile assigned"
        );

        outcome.profile_uuid = Some(profile_uuid);
        outcome.results = results;
        Ok(outcome)
    }

    /// Custom profile of the team scope if there is one, else the default
    async fn resolve_profile_uuid(&self, team: Option<&Team>) -> Result<String> {
        let scope = crate::model::TeamScope::of(team);

        let custom = self
            .registrar
            .ensure_custom_setup_assistant_if_exists(team)
            .await
            .context(format!("ensure setup assistant for {}", scope))?;
        if !custom.is_empty() {
            return Ok(custom.profile_uuid);
        }

        let default = self
            .registrar
            .ensure_default_setup_assistant(team)
            .await
            .context("ensure default setup assistant")?;
        Ok(default.profile_uuid)
    }
}

#[async_trait]
impl PageHandler for Reconciler {
    async fn handle_page(&self, is_fetch: bool, page: &DeviceResponse) -> Result<Vec<String>> {
        let outcome = self.process_device_response(page).await?;
        debug!(
            phase = if is_fetch { "fetch" } else { "sync" },
            added = outcome.added,
            modified = outcome.modified,
            reclassified = outcome.reclassified,
            deleted = outcome.deleted,
            dropped = outcome.dropped,
            "Page reconciled"
        );
        Ok(outcome.errors)
    }
}
