//! Application configuration persisted in the datastore
//!
//! Unlike [`crate::config::AssignerConfig`] (the on-disk service config), this
//! is mutable runtime state shared by every component, including the Apple
//! Business Manager terms flag.

use super::team::Team;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server_settings: ServerSettings,

    #[serde(default)]
    pub mdm: MdmSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Public base URL devices use to reach this server
    #[serde(default)]
    pub server_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdmSettings {
    /// Set while Apple Business Manager has unaccepted terms
    #[serde(default)]
    pub apple_bm_terms_expired: bool,

    /// Name of the team newly synced devices are placed into (empty = no team)
    #[serde(default)]
    pub apple_bm_default_team: String,

    /// Setup settings for hosts with no team
    #[serde(default)]
    pub macos_setup: MacosSetup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacosSetup {
    #[serde(default)]
    pub enable_end_user_authentication: bool,
}

impl AppConfig {
    /// Whether `team` is the team DEP devices are ingested into
    pub fn is_dep_default_team(&self, team: &Team) -> bool {
        !self.mdm.apple_bm_default_team.is_empty() && self.mdm.apple_bm_default_team == team.name
    }

    /// End-user authentication setting for a team, or for no team
    pub fn end_user_auth_enabled(&self, team: Option<&Team>) -> bool {
        match team {
            Some(team) => team.config.mdm.macos_setup.enable_end_user_authentication,
            None => self.mdm.macos_setup.enable_end_user_authentication,
        }
    }
}
