//! Domain model
//!
//! Records the assigner reads from and writes to the datastore:
//! enrollment profiles, setup assistants, teams and the application
//! configuration. Device records come from the DEP API and live in the
//! `depapi` crate.

mod app_config;
mod enrollment;
mod team;

pub use app_config::{AppConfig, MacosSetup, MdmSettings, ServerSettings};
pub use enrollment::{
    EnrollmentProfile, EnrollmentProfilePayload, EnrollmentType, RegisteredProfile,
    SetupAssistant,
};
pub use team::{Team, TeamConfig, TeamMdm, TeamScope};
