//! Setup assistant profile registration

use super::profile::{default_profile, prepare_profile, ProfileSource};
use super::{enroll_url, DepApi};
use crate::datastore::Datastore;
use crate::model::{
    EnrollmentProfile, EnrollmentProfilePayload, EnrollmentType, RegisteredProfile, Team,
    TeamScope,
};
use crate::{AssignerError, Result, ResultExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps the setup assistant profiles of each team scope defined with DEP
///
/// A registration is cached (as the returned profile UUID) per scope and
/// content version; it is only repeated after the content changes.
pub struct ProfileRegistrar {
    store: Arc<dyn Datastore>,
    client: Arc<dyn DepApi>,
}

impl ProfileRegistrar {
    pub fn new(store: Arc<dyn Datastore>, client: Arc<dyn DepApi>) -> Self {
        Self { store, client }
    }

    /// Make sure the built-in profile is registered for the scope of `team`
    ///
    /// Also creates the automatic enrollment profile (and with it the enroll
    /// token) the first time it runs.
    pub async fn ensure_default_setup_assistant(
        &self,
        team: Option<&Team>,
    ) -> Result<RegisteredProfile> {
        self.automatic_profile().await?;

        let scope = TeamScope::of(team);
        match self.store.default_setup_assistant(scope).await {
            Ok((uuid, modified_at)) if !uuid.is_empty() => {
                return Ok(RegisteredProfile::new(uuid, modified_at));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context("get default setup assistant profile uuid")),
        }

        info!(scope = %scope, "Default setup assistant not registered yet, registering");
        self.register_profile(team, ProfileSource::Default)
            .await
            .context("register default setup assistant with Apple")?;

        let (uuid, modified_at) = self
            .store
            .default_setup_assistant(scope)
            .await
            .context("get default setup assistant profile uuid after registration")?;
        Ok(RegisteredProfile::new(uuid, modified_at))
    }

    /// Register the custom setup assistant of the scope of `team`, if one
    /// was uploaded and is not registered yet
    ///
    /// Returns the empty profile when the scope has no custom assistant.
    pub async fn ensure_custom_setup_assistant_if_exists(
        &self,
        team: Option<&Team>,
    ) -> Result<RegisteredProfile> {
        let scope = TeamScope::of(team);
        let assistant = match self.store.setup_assistant(scope).await {
            Ok(assistant) => assistant,
            Err(e) if e.is_not_found() => {
                debug!(scope = %scope, "No custom setup assistant");
                return Ok(RegisteredProfile::default());
            }
            Err(e) => return Err(e.context("get custom setup assistant")),
        };

        let profile_uuid = if assistant.is_registered() {
            assistant.profile_uuid.clone()
        } else {
            info!(scope = %scope, name = %assistant.name, "Registering custom setup assistant");
            self.register_profile(team, ProfileSource::Custom(&assistant))
                .await
                .context("register custom setup assistant with Apple")?
        };

        Ok(RegisteredProfile::new(profile_uuid, assistant.uploaded_at))
    }

    /// Define a profile with DEP and persist the returned UUID for its scope
    ///
    /// Always uses the automatic enrollment profile's token for the enroll
    /// URL, whichever content is registered.
    pub async fn register_profile(
        &self,
        team: Option<&Team>,
        source: ProfileSource<'_>,
    ) -> Result<String> {
        let app_config = self.store.app_config().await.context("fetching app config")?;

        let automatic = self.automatic_profile().await?;

        let enroll_url =
            enroll_url(&automatic.token, &app_config).context("generating enroll URL")?;

        let raw = match source {
            ProfileSource::Default => automatic.dep_profile.as_deref().ok_or_else(|| {
                AssignerError::Storage("automatic enrollment profile has no DEP profile".into())
            })?,
            ProfileSource::Custom(assistant) => assistant.profile.as_str(),
        };

        let profile = prepare_profile(raw, &enroll_url, &app_config, team)
            .context("unmarshalling DEP profile")?;

        let response = self
            .client
            .define_profile(&profile)
            .await
            .context("apple POST /profile request failed")?;

        let scope = TeamScope::of(team);
        match source {
            ProfileSource::Custom(_) => self
                .store
                .set_setup_assistant_profile_uuid(scope, &response.profile_uuid)
                .await
                .context("save setup assistant profile UUID")?,
            ProfileSource::Default => self
                .store
                .set_default_setup_assistant_profile_uuid(scope, &response.profile_uuid)
                .await
                .context("save default setup assistant profile UUID")?,
        }

        info!(
            scope = %scope,
            profile_uuid = %response.profile_uuid,
            "Registered profile with DEP"
        );
        Ok(response.profile_uuid)
    }

    /// The automatic enrollment profile, created on first use
    async fn automatic_profile(&self) -> Result<EnrollmentProfile> {
        match self
            .store
            .enrollment_profile_by_type(EnrollmentType::Automatic)
            .await
        {
            Ok(profile) => Ok(profile),
            Err(e) if e.is_not_found() => self
                .create_default_automatic_profile()
                .await
                .context("create default automatic profile"),
            Err(e) => Err(e.context("get default automatic profile")),
        }
    }

    async fn create_default_automatic_profile(&self) -> Result<EnrollmentProfile> {
        let raw = serde_json::to_string(&default_profile()).context("marshaling default profile")?;
        let payload = EnrollmentProfilePayload {
            token: uuid::Uuid::new_v4().to_string(),
            enrollment_type: EnrollmentType::Automatic,
            dep_profile: Some(raw),
        };
        let profile = self
            .store
            .new_enrollment_profile(payload)
            .await
            .context("saving enrollment profile in DB")?;
        info!("Created default automatic enrollment profile");
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{AppConfigStore, SqliteStore};
    use crate::dep::testing::FakeDepClient;
    use crate::model::AppConfig;

    async fn setup() -> (Arc<SqliteStore>, Arc<FakeDepClient>, ProfileRegistrar) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut cfg = AppConfig::default();
        cfg.server_settings.server_url = "https://mdm.example.com".to_string();
        store.save_app_config(&cfg).await.unwrap();

        let client = Arc::new(FakeDepClient::new());
        let registrar = ProfileRegistrar::new(store.clone(), client.clone());
        (store, client, registrar)
    }

    #[tokio::test]
    async fn test_default_registered_once() {
        let (store, client, registrar) = setup().await;

        let first = registrar.ensure_default_setup_assistant(None).await.unwrap();
        assert_eq!(first.profile_uuid, "profile-1");
        assert!(first.modified_at.is_some());

        let second = registrar.ensure_default_setup_assistant(None).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(client.defined().len(), 1);

        // The enroll token was created with the automatic profile
        let automatic = store
            .enrollment_profile_by_type(EnrollmentType::Automatic)
            .await
            .unwrap();
        let defined = &client.defined()[0];
        assert!(defined.url.ends_with(&format!("token={}", automatic.token)));
        assert_eq!(defined.configuration_web_url, defined.url);
        assert_eq!(defined.skip_setup_items.len(), 19);
    }

    #[tokio::test]
    async fn test_default_registered_per_scope() {
        let (store, client, registrar) = setup().await;
        let team = store.create_team("Laptops", true).unwrap();

        registrar.ensure_default_setup_assistant(None).await.unwrap();
        let team_profile = registrar
            .ensure_default_setup_assistant(Some(&team))
            .await
            .unwrap();

        assert_eq!(team_profile.profile_uuid, "profile-2");
        let defined = client.defined();
        assert_eq!(defined.len(), 2);
        assert_eq!(
            defined[1].configuration_web_url,
            "https://mdm.example.com/mdm/sso"
        );
    }

    #[tokio::test]
    async fn test_no_custom_assistant_is_empty() {
        let (_store, client, registrar) = setup().await;

        let custom = registrar
            .ensure_custom_setup_assistant_if_exists(None)
            .await
            .unwrap();
        assert!(custom.is_empty());
        assert!(custom.modified_at.is_none());
        assert!(client.defined().is_empty());
    }

    #[tokio::test]
    async fn test_custom_registers_on_fresh_store() {
        let (store, client, registrar) = setup().await;
        store
            .set_setup_assistant(TeamScope::NoTeam, "Kiosk", r#"{"profile_name": "Kiosk"}"#)
            .unwrap();

        // No default pass ran, so the automatic profile is created here
        let custom = registrar
            .ensure_custom_setup_assistant_if_exists(None)
            .await
            .unwrap();
        assert_eq!(custom.profile_uuid, "profile-1");

        let automatic = store
            .enrollment_profile_by_type(EnrollmentType::Automatic)
            .await
            .unwrap();
        let defined = client.defined();
        assert_eq!(defined.len(), 1);
        assert!(defined[0].url.ends_with(&format!("token={}", automatic.token)));

        // The token is reused by later registrations
        registrar.ensure_default_setup_assistant(None).await.unwrap();
        let again = store
            .enrollment_profile_by_type(EnrollmentType::Automatic)
            .await
            .unwrap();
        assert_eq!(again.token, automatic.token);
    }

    #[tokio::test]
    async fn test_custom_reregistered_only_after_content_change() {
        let (store, client, registrar) = setup().await;
        registrar.ensure_default_setup_assistant(None).await.unwrap();

        let asst = store
            .set_setup_assistant(TeamScope::NoTeam, "Kiosk", r#"{"profile_name": "Kiosk"}"#)
            .unwrap();

        let first = registrar
            .ensure_custom_setup_assistant_if_exists(None)
            .await
            .unwrap();
        assert_eq!(first.profile_uuid, "profile-2");
        assert_eq!(first.modified_at, Some(asst.uploaded_at));

        let again = registrar
            .ensure_custom_setup_assistant_if_exists(None)
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(client.defined().len(), 2);

        store
            .set_setup_assistant(TeamScope::NoTeam, "Kiosk", r#"{"profile_name": "Kiosk v2"}"#)
            .unwrap();
        let changed = registrar
            .ensure_custom_setup_assistant_if_exists(None)
            .await
            .unwrap();
        assert_eq!(changed.profile_uuid, "profile-3");
        assert_eq!(client.defined()[2].profile_name, "Kiosk v2");
    }

    #[tokio::test]
    async fn test_define_failure_is_not_cached() {
        let (store, client, registrar) = setup().await;
        client.fail_next_define(depapi::Error::TermsNotSigned);

        let err = registrar
            .ensure_default_setup_assistant(None)
            .await
            .unwrap_err();
        assert!(err.is_terms_not_signed());
        assert!(store
            .default_setup_assistant(TeamScope::NoTeam)
            .await
            .unwrap_err()
            .is_not_found());

        let retried = registrar.ensure_default_setup_assistant(None).await.unwrap();
        assert_eq!(retried.profile_uuid, "profile-1");
    }
}
