//! Persistence interfaces
//!
//! The assigner only talks to storage through these traits:
//!
//! - [`AppConfigStore`]: get/save of the shared [`AppConfig`]. This is the one
//!   capability the terms gate needs, so it is split out.
//! - [`Datastore`]: profiles, setup assistants, teams and hosts.
//! - [`CursorStorage`]: the DEP sync cursor, keyed by DEP client name.
//!
//! [`SqliteStore`] implements all three.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::model::{
    AppConfig, EnrollmentProfile, EnrollmentProfilePayload, EnrollmentType, SetupAssistant, Team,
    TeamScope,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depapi::Device;
use std::collections::HashSet;

/// Shared application configuration
#[async_trait]
pub trait AppConfigStore: Send + Sync {
    async fn app_config(&self) -> Result<AppConfig>;

    async fn save_app_config(&self, config: &AppConfig) -> Result<()>;
}

/// Datastore operations consumed by the DEP assigner
///
/// Lookups of a single row return a NotFound error when the row is absent
/// (see [`crate::AssignerError::is_not_found`]).
#[async_trait]
pub trait Datastore: AppConfigStore {
    async fn enrollment_profile_by_type(
        &self,
        enrollment_type: EnrollmentType,
    ) -> Result<EnrollmentProfile>;

    async fn new_enrollment_profile(
        &self,
        payload: EnrollmentProfilePayload,
    ) -> Result<EnrollmentProfile>;

    /// Custom setup assistant for a scope
    async fn setup_assistant(&self, scope: TeamScope) -> Result<SetupAssistant>;

    async fn set_setup_assistant_profile_uuid(
        &self,
        scope: TeamScope,
        profile_uuid: &str,
    ) -> Result<()>;

    /// Profile UUID registered for the default setup assistant of a scope
    /// and when it was registered
    async fn default_setup_assistant(&self, scope: TeamScope)
        -> Result<(String, DateTime<Utc>)>;

    async fn set_default_setup_assistant_profile_uuid(
        &self,
        scope: TeamScope,
        profile_uuid: &str,
    ) -> Result<()>;

    /// Forget every registered profile UUID, default and custom, so the next
    /// pass defines them again. Custom assistants count as re-uploaded.
    async fn clear_profile_registrations(&self) -> Result<()>;

    async fn team(&self, id: u32) -> Result<Team>;

    async fn team_by_name(&self, name: &str) -> Result<Team>;

    /// Subset of `serials` that belong to known hosts
    async fn matching_host_serials(&self, serials: &[String]) -> Result<HashSet<String>>;

    /// Unlink hosts from DEP. Serials with no assignment are ignored.
    async fn delete_host_dep_assignments(&self, serials: &[String]) -> Result<()>;

    /// Create pending hosts for devices seen in a DEP sync
    ///
    /// Returns the number of hosts created and the team the devices were
    /// placed into.
    async fn ingest_devices_from_dep_sync(
        &self,
        devices: &[Device],
    ) -> Result<(usize, Option<u32>)>;
}

/// Position in the DEP device sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub token: String,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Cursor {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

/// Storage for the DEP sync cursor
#[async_trait]
pub trait CursorStorage: Send + Sync {
    /// Stored cursor, or an empty one if none was stored yet
    async fn retrieve_cursor(&self, name: &str) -> Result<Cursor>;

    /// Store (or clear, with `""`) the cursor, stamping it with the current time
    async fn store_cursor(&self, name: &str, cursor: &str) -> Result<()>;
}
