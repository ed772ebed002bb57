//! In-memory DEP doubles for unit tests

use super::DepApi;
use crate::datastore::{Cursor, CursorStorage};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depapi::{AssignProfileResponse, DeviceResponse, Profile, ProfileResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    fetch_pages: VecDeque<depapi::Result<DeviceResponse>>,
    sync_pages: VecDeque<depapi::Result<DeviceResponse>>,
    define_errors: VecDeque<depapi::Error>,
    assign_errors: VecDeque<depapi::Error>,
    assign_results: HashMap<String, String>,
    define_uuid: Option<String>,

    fetch_calls: Vec<Option<String>>,
    sync_calls: Vec<String>,
    defined: Vec<Profile>,
    assigned: Vec<(String, Vec<String>)>,
}

/// Scriptable [`DepApi`] that records every call
///
/// Unscripted fetch/sync calls return an empty final page. Defined profiles
/// get UUIDs `profile-1`, `profile-2`, ... unless a fixed UUID is set.
/// Assignments succeed for every serial unless a result is overridden.
#[derive(Default)]
pub(crate) struct FakeDepClient {
    state: Mutex<FakeState>,
}

impl FakeDepClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn push_fetch(&self, page: depapi::Result<DeviceResponse>) {
        self.state().fetch_pages.push_back(page);
    }

    pub fn push_sync(&self, page: depapi::Result<DeviceResponse>) {
        self.state().sync_pages.push_back(page);
    }

    pub fn fail_next_define(&self, err: depapi::Error) {
        self.state().define_errors.push_back(err);
    }

    pub fn fail_next_assign(&self, err: depapi::Error) {
        self.state().assign_errors.push_back(err);
    }

    /// Every define call answers with this UUID (may be empty)
    pub fn set_define_uuid(&self, uuid: &str) {
        self.state().define_uuid = Some(uuid.to_string());
    }

    pub fn set_assign_result(&self, serial: &str, result: &str) {
        self.state()
            .assign_results
            .insert(serial.to_string(), result.to_string());
    }

    pub fn fetch_calls(&self) -> Vec<Option<String>> {
        self.state().fetch_calls.clone()
    }

    pub fn sync_calls(&self) -> Vec<String> {
        self.state().sync_calls.clone()
    }

    pub fn defined(&self) -> Vec<Profile> {
        self.state().defined.clone()
    }

    pub fn assigned(&self) -> Vec<(String, Vec<String>)> {
        self.state().assigned.clone()
    }
}

#[async_trait]
impl DepApi for FakeDepClient {
    async fn fetch_devices(
        &self,
        cursor: Option<&str>,
        _limit: u32,
    ) -> depapi::Result<DeviceResponse> {
        let mut state = self.state();
        state.fetch_calls.push(cursor.map(str::to_string));
        state
            .fetch_pages
            .pop_front()
            .unwrap_or_else(|| Ok(DeviceResponse::default()))
    }

    async fn sync_devices(&self, cursor: &str, _limit: u32) -> depapi::Result<DeviceResponse> {
        let mut state = self.state();
        state.sync_calls.push(cursor.to_string());
        state
            .sync_pages
            .pop_front()
            .unwrap_or_else(|| Ok(DeviceResponse::default()))
    }

    async fn define_profile(&self, profile: &Profile) -> depapi::Result<ProfileResponse> {
        let mut state = self.state();
        if let Some(err) = state.define_errors.pop_front() {
            return Err(err);
        }
        state.defined.push(profile.clone());
        let profile_uuid = match &state.define_uuid {
            Some(uuid) => uuid.clone(),
            None => format!("profile-{}", state.defined.len()),
        };
        Ok(ProfileResponse {
            profile_uuid,
            devices: HashMap::new(),
        })
    }

    async fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> depapi::Result<AssignProfileResponse> {
        let mut state = self.state();
        if let Some(err) = state.assign_errors.pop_front() {
            return Err(err);
        }
        state
            .assigned
            .push((profile_uuid.to_string(), serials.to_vec()));
        let devices = serials
            .iter()
            .map(|serial| {
                let result = state
                    .assign_results
                    .get(serial)
                    .cloned()
                    .unwrap_or_else(|| "SUCCESS".to_string());
                (serial.clone(), result)
            })
            .collect();
        Ok(AssignProfileResponse {
            profile_uuid: profile_uuid.to_string(),
            devices,
        })
    }
}

/// Cursor storage with a controllable modification time
#[derive(Default)]
pub(crate) struct MemoryCursors {
    cursors: Mutex<HashMap<String, Cursor>>,
    stores: Mutex<Vec<String>>,
}

impl MemoryCursors {
    pub fn with_cursor(name: &str, token: &str, modified_at: DateTime<Utc>) -> Self {
        let cursors = Self::default();
        cursors.cursors.lock().unwrap().insert(
            name.to_string(),
            Cursor {
                token: token.to_string(),
                modified_at: Some(modified_at),
            },
        );
        cursors
    }

    /// Every value passed to `store_cursor`, in order
    pub fn stores(&self) -> Vec<String> {
        self.stores.lock().unwrap().clone()
    }

    pub fn current(&self, name: &str) -> String {
        self.cursors
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.token.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CursorStorage for MemoryCursors {
    async fn retrieve_cursor(&self, name: &str) -> Result<Cursor> {
        Ok(self
            .cursors
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn store_cursor(&self, name: &str, cursor: &str) -> Result<()> {
        self.stores.lock().unwrap().push(cursor.to_string());
        self.cursors.lock().unwrap().insert(
            name.to_string(),
            Cursor {
                token: cursor.to_string(),
                modified_at: Some(Utc::now()),
            },
        );
        Ok(())
    }
}

/// A device page
pub(crate) fn page(devices: Vec<depapi::Device>, cursor: &str, more: bool) -> DeviceResponse {
    DeviceResponse {
        devices,
        cursor: cursor.to_string(),
        fetched_until: None,
        more_to_follow: more,
    }
}
