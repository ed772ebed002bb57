//! Apple Business Manager terms tracking

use super::DepApi;
use crate::datastore::AppConfigStore;
use crate::metrics;
use async_trait::async_trait;
use depapi::{AssignProfileResponse, DeviceResponse, Profile, ProfileResponse};
use std::sync::Arc;
use tracing::{error, info, warn};

/// [`DepApi`] decorator that mirrors "terms not signed" into the app config
///
/// After each call: a success clears `apple_bm_terms_expired`, a
/// [`depapi::Error::TermsNotSigned`] sets it, anything else leaves it alone.
/// The flag is only written when it changes, and failing to read or write it
/// never changes what the call returns.
pub struct TermsGate<S: AppConfigStore + ?Sized> {
    inner: Arc<dyn DepApi>,
    store: Arc<S>,
}

impl<S: AppConfigStore + ?Sized> TermsGate<S> {
    pub fn new(inner: Arc<dyn DepApi>, store: Arc<S>) -> Self {
        Self { inner, store }
    }

    async fn observe<T>(&self, result: depapi::Result<T>) -> depapi::Result<T> {
        let expired = match &result {
            Ok(_) => false,
            Err(e) => {
                metrics::record_api_error(e.kind());
                if !e.is_terms_not_signed() {
                    return result;
                }
                true
            }
        };

        self.update_flag(expired).await;
        result
    }

    async fn update_flag(&self, expired: bool) {
        let mut app_config = match self.store.app_config().await {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "Failed to read app config for terms flag");
                return;
            }
        };

        if app_config.mdm.apple_bm_terms_expired == expired {
            return;
        }

        app_config.mdm.apple_bm_terms_expired = expired;
        if let Err(e) = self.store.save_app_config(&app_config).await {
            error!(error = %e, expired, "Failed to save terms flag");
            return;
        }

        metrics::set_terms_expired(expired);
        if expired {
            warn!("Apple Business Manager terms are not signed; DEP calls will fail until they are accepted");
        } else {
            info!("Apple Business Manager terms accepted; cleared terms flag");
        }
    }
}

#[async_trait]
impl<S: AppConfigStore + ?Sized> DepApi for TermsGate<S> {
    async fn fetch_devices(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> depapi::Result<DeviceResponse> {
        let result = self.inner.fetch_devices(cursor, limit).await;
        self.observe(result).await
    }

    async fn sync_devices(&self, cursor: &str, limit: u32) -> depapi::Result<DeviceResponse> {
        let result = self.inner.sync_devices(cursor, limit).await;
        self.observe(result).await
    }

    async fn define_profile(&self, profile: &Profile) -> depapi::Result<ProfileResponse> {
        let result = self.inner.define_profile(profile).await;
        self.observe(result).await
    }

    async fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> depapi::Result<AssignProfileResponse> {
        let result = self.inner.assign_profile(profile_uuid, serials).await;
        self.observe(result).await
    }
}
