//! Apple DEP reconciliation and profile assignment
//!
//! # Architecture
//!
//! One assigner pass ([`DepService::run_assigner`]) runs these steps:
//!
//! 1. **Scope**: resolve the DEP default team from the app config
//! 2. **Register**: make sure the default (and any custom) setup assistant
//!    profile is defined with DEP ([`ProfileRegistrar`])
//! 3. **Cursor check**: clear the sync cursor if the effective profile changed
//!    after the cursor was stored, forcing a full resync
//! 4. **Sync**: page through DEP device events ([`DeviceSyncer`]), handing
//!    each page to the [`Reconciler`], which updates hosts and assigns the
//!    profile to new devices
//!
//! Every DEP call goes through the [`TermsGate`], which keeps the app
//! config's terms-expired flag in step with the DEP service.

mod client;
mod profile;
mod reconciler;
mod registrar;
mod service;
mod syncer;
mod terms;

#[cfg(test)]
pub(crate) mod testing;

pub use client::DepApi;
pub use profile::{default_profile, prepare_profile, ProfileSource, DEFAULT_SKIP_SETUP_ITEMS};
pub use reconciler::{classify_devices, count_results, Classification, ReconcileOutcome, Reconciler};
pub use registrar::ProfileRegistrar;
pub use service::{cursor_needs_reset, DepService, RunSummary};
pub use syncer::{DeviceSyncer, PageHandler, SyncOptions, SyncSummary};
pub use terms::TermsGate;

use crate::model::AppConfig;
use crate::{AssignerError, Result};
use reqwest::Url;

/// Name of the single DEP configuration set this deployment uses. Keys the
/// stored sync cursor.
pub const DEP_NAME: &str = "assigner";

/// Path that serves the enrollment profile to devices
pub const ENROLL_PATH: &str = "/api/mdm/apple/enroll";

/// Path that starts end-user authentication before enrollment
pub const SSO_PATH: &str = "/mdm/sso";

/// Join `rel_path` onto the path of `server_url`
///
/// With `clean_query` any query string on the server URL is dropped.
pub fn resolve_url(server_url: &str, rel_path: &str, clean_query: bool) -> Result<Url> {
    let mut url = Url::parse(server_url).map_err(|e| {
        AssignerError::Config(format!("invalid server URL {:?}: {}", server_url, e))
    })?;

    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        rel_path.trim_start_matches('/')
    );
    url.set_path(&joined);
    if clean_query {
        url.set_query(None);
    }
    Ok(url)
}

/// URL devices use to download the enrollment profile, authenticated by the
/// automatic profile's token
pub fn enroll_url(token: &str, app_config: &AppConfig) -> Result<String> {
    let mut url = resolve_url(&app_config.server_settings.server_url, ENROLL_PATH, false)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

/// Entry point of the end-user authentication flow
pub fn sso_url(app_config: &AppConfig) -> String {
    format!("{}{}", app_config.server_settings.server_url, SSO_PATH)
}
