//! Teams and team scopes

use serde::{Deserialize, Serialize};
use std::fmt;

/// A team groups hosts that share enrollment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub config: TeamConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    pub mdm: TeamMdm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMdm {
    #[serde(default)]
    pub macos_setup: super::MacosSetup,
}

impl Team {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            config: TeamConfig::default(),
        }
    }

    pub fn with_end_user_auth(mut self, enabled: bool) -> Self {
        self.config.mdm.macos_setup.enable_end_user_authentication = enabled;
        self
    }

    pub fn scope(&self) -> TeamScope {
        TeamScope::Team(self.id)
    }
}

/// Scope that per-team records are keyed by
///
/// "No team" is a real scope with its own setup assistant and registered
/// profile, not an absent value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TeamScope {
    NoTeam,
    Team(u32),
}

impl TeamScope {
    pub fn of(team: Option<&Team>) -> Self {
        team.map_or(TeamScope::NoTeam, Team::scope)
    }

    pub fn from_id(team_id: Option<u32>) -> Self {
        team_id.map_or(TeamScope::NoTeam, TeamScope::Team)
    }

    pub fn team_id(self) -> Option<u32> {
        match self {
            TeamScope::NoTeam => None,
            TeamScope::Team(id) => Some(id),
        }
    }

    /// Non-null column value for tables keyed by scope (0 = no team)
    pub(crate) fn storage_key(self) -> i64 {
        match self {
            TeamScope::NoTeam => 0,
            TeamScope::Team(id) => i64::from(id),
        }
    }
}

impl fmt::Display for TeamScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamScope::NoTeam => write!(f, "no team"),
            TeamScope::Team(id) => write!(f, "team {}", id),
        }
    }
}
