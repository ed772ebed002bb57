//! DEP profile documents

use crate::model::{AppConfig, SetupAssistant, Team};
use crate::Result;
use depapi::Profile;

/// Setup Assistant panes the built-in profile skips
pub const DEFAULT_SKIP_SETUP_ITEMS: [&str; 19] = [
    "Accessibility",
    "Appearance",
    "AppleID",
    "AppStore",
    "Biometric",
    "Diagnostics",
    "FileVault",
    "iCloudDiagnostics",
    "iCloudStorage",
    "Location",
    "Payment",
    "Privacy",
    "Restore",
    "ScreenTime",
    "Siri",
    "TermsOfAddress",
    "TOS",
    "UnlockWithWatch",
    "Wallpaper",
];

/// Where the content of a profile being registered comes from
#[derive(Debug, Clone, Copy)]
pub enum ProfileSource<'a> {
    /// The built-in profile stored on the automatic enrollment profile
    Default,
    /// An administrator-uploaded setup assistant
    Custom(&'a SetupAssistant),
}

/// The built-in profile used when no custom setup assistant exists
pub fn default_profile() -> Profile {
    Profile {
        profile_name: "Default automatic enrollment profile".to_string(),
        allow_pairing: true,
        auto_advance_setup: false,
        await_device_configured: false,
        is_supervised: false,
        is_multi_user: false,
        is_mandatory: false,
        is_mdm_removable: true,
        language: "en".to_string(),
        org_magic: "1".to_string(),
        region: "US".to_string(),
        skip_setup_items: DEFAULT_SKIP_SETUP_ITEMS.iter().map(|s| s.to_string()).collect(),
        ..Profile::default()
    }
}

/// Turn stored profile JSON into the document sent to DEP
///
/// Server-controlled fields are always overwritten: `url` points at the
/// enroll URL, and so does `configuration_web_url` unless end-user
/// authentication is enabled for the scope, in which case it points at the
/// SSO page.
pub fn prepare_profile(
    raw: &str,
    enroll_url: &str,
    app_config: &AppConfig,
    team: Option<&Team>,
) -> Result<Profile> {
    let mut profile: Profile = serde_json::from_str(raw)?;

    profile.url = enroll_url.to_string();
    profile.configuration_web_url = if app_config.end_user_auth_enabled(team) {
        super::sso_url(app_config)
    } else {
        enroll_url.to_string()
    };

    Ok(profile)
}
