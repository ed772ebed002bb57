//! The DEP API seam

use async_trait::async_trait;
use depapi::{AssignProfileResponse, DeviceResponse, Profile, ProfileResponse};

/// Operations the assigner performs against the DEP service
///
/// Implemented over HTTP by [`crate::integrations::AppleDepClient`] and
/// decorated by [`super::TermsGate`].
#[async_trait]
pub trait DepApi: Send + Sync {
    /// Page through every device assigned to this server. `None` starts over.
    async fn fetch_devices(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> depapi::Result<DeviceResponse>;

    /// Device events since `cursor`
    async fn sync_devices(&self, cursor: &str, limit: u32) -> depapi::Result<DeviceResponse>;

    /// Define a profile; DEP answers with a fresh UUID
    async fn define_profile(&self, profile: &Profile) -> depapi::Result<ProfileResponse>;

    /// Assign a defined profile to devices. The response maps each serial
    /// to a result string such as `SUCCESS`.
    async fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> depapi::Result<AssignProfileResponse>;
}
