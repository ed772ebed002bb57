//! Enrollment profiles and setup assistants

use super::team::TeamScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How devices obtain an enrollment profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentType {
    /// Delivered through DEP during Setup Assistant
    Automatic,
    /// Downloaded and installed by the user
    Manual,
}

impl EnrollmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentType::Automatic => "automatic",
            EnrollmentType::Manual => "manual",
        }
    }
}

impl fmt::Display for EnrollmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnrollmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(EnrollmentType::Automatic),
            "manual" => Ok(EnrollmentType::Manual),
            other => Err(format!("unknown enrollment type: {}", other)),
        }
    }
}

/// A stored enrollment profile
///
/// The token of the automatic profile authenticates enrollment profile
/// downloads; it is generated once and never rotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentProfile {
    pub id: u32,
    pub token: String,
    pub enrollment_type: EnrollmentType,
    /// Raw DEP profile JSON
    pub dep_profile: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create an [`EnrollmentProfile`]
#[derive(Debug, Clone)]
pub struct EnrollmentProfilePayload {
    pub token: String,
    pub enrollment_type: EnrollmentType,
    pub dep_profile: Option<String>,
}

/// A custom Setup Assistant uploaded by an administrator for a team scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupAssistant {
    pub id: u32,
    pub team_id: Option<u32>,
    pub name: String,
    /// Raw DEP profile JSON
    pub profile: String,
    /// UUID returned by DEP when this content was defined (empty = unregistered)
    pub profile_uuid: String,
    /// When the current content was uploaded
    pub uploaded_at: DateTime<Utc>,
}

impl SetupAssistant {
    pub fn scope(&self) -> TeamScope {
        TeamScope::from_id(self.team_id)
    }

    pub fn is_registered(&self) -> bool {
        !self.profile_uuid.is_empty()
    }
}

/// A profile UUID registered with DEP and the modification time of the
/// content it was registered for
///
/// The empty value (no UUID, no time) means "nothing registered".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisteredProfile {
    pub profile_uuid: String,
    pub modified_at: Option<DateTime<Utc>>,
}

impl RegisteredProfile {
    pub fn new(profile_uuid: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            profile_uuid: profile_uuid.into(),
            modified_at: Some(modified_at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.profile_uuid.is_empty()
    }
}
