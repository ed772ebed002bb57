//! Apple Device Enrollment Program (DEP) API types for Rust
//!
//! Request/response bodies exchanged with the DEP service, plus the error
//! classification the DEP service signals through HTTP status codes and
//! plain-text bodies (terms not signed, cursor exhausted, ...).
//!
//! This crate does no I/O. Transport lives with the caller.
//!
//! # Example
//!
//! ```
//! use depapi::{Error, Profile};
//!
//! let profile: Profile = serde_json::from_str(r#"{"profile_name": "Laptops"}"#)?;
//! assert!(profile.is_mdm_removable);
//!
//! let err = Error::from_response(403, "T_C_NOT_SIGNED");
//! assert!(err.is_terms_not_signed());
//! # Ok::<(), serde_json::Error>(())
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Default page size requested from the device fetch/sync endpoints
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Largest page size the DEP service accepts
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Errors returned by the DEP service (or while talking to it)
#[derive(Error, Debug)]
pub enum Error {
    /// The organization must accept updated Apple Business Manager terms
    #[error("DEP terms and conditions not signed")]
    TermsNotSigned,

    /// The fetch cursor reached the end of the device list
    #[error("DEP cursor exhausted")]
    CursorExhausted,

    #[error("DEP cursor invalid")]
    CursorInvalid,

    #[error("DEP cursor expired")]
    CursorExpired,

    /// Any other non-success response
    #[error("DEP API error: HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, TLS or timeout failure before a response was read
    #[error("DEP transport error: {0}")]
    Transport(String),

    #[error("DEP JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for DEP operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify a non-success HTTP response
    ///
    /// The DEP service reports well-known conditions as a bare token in the
    /// body, sometimes JSON-quoted (`"T_C_NOT_SIGNED"`).
    pub fn from_response(status: u16, body: &str) -> Self {
        let token = body.trim().trim_matches('"');
        match (status, token) {
            (403, "T_C_NOT_SIGNED") => Error::TermsNotSigned,
            (400, "EXHAUSTED_CURSOR") => Error::CursorExhausted,
            (400, "INVALID_CURSOR") => Error::CursorInvalid,
            (400, "EXPIRED_CURSOR") => Error::CursorExpired,
            _ => Error::Http {
                status,
                body: body.trim().to_string(),
            },
        }
    }

    pub fn is_terms_not_signed(&self) -> bool {
        matches!(self, Error::TermsNotSigned)
    }

    pub fn is_cursor_exhausted(&self) -> bool {
        matches!(self, Error::CursorExhausted)
    }

    /// Cursor can no longer be used and a full fetch must start over
    pub fn is_cursor_unusable(&self) -> bool {
        matches!(self, Error::CursorInvalid | Error::CursorExpired)
    }

    /// HTTP status code, if the error came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::TermsNotSigned => Some(403),
            Error::CursorExhausted | Error::CursorInvalid | Error::CursorExpired => Some(400),
            Error::Http { status, .. } => Some(*status),
            Error::Transport(_) | Error::Json(_) => None,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TermsNotSigned => "terms_not_signed",
            Error::CursorExhausted => "cursor_exhausted",
            Error::CursorInvalid => "cursor_invalid",
            Error::CursorExpired => "cursor_expired",
            Error::Http { .. } => "http",
            Error::Transport(_) => "transport",
            Error::Json(_) => "json",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Enrollment profile document defined with `POST /profile`
///
/// `is_mdm_removable` defaults to `true` when absent, matching Apple's
/// documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub profile_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default)]
    pub allow_pairing: bool,

    #[serde(default)]
    pub is_supervised: bool,

    #[serde(default)]
    pub is_multi_user: bool,

    #[serde(default)]
    pub is_mandatory: bool,

    #[serde(default)]
    pub await_device_configured: bool,

    #[serde(default = "default_true")]
    pub is_mdm_removable: bool,

    #[serde(default)]
    pub auto_advance_setup: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_phone_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_email_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org_magic: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    #[serde(default)]
    pub skip_setup_items: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration_web_url: String,

    /// Serials to assign at definition time (unused by the assigner)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            profile_name: String::new(),
            url: String::new(),
            allow_pairing: false,
            is_supervised: false,
            is_multi_user: false,
            is_mandatory: false,
            await_device_configured: false,
            is_mdm_removable: true,
            auto_advance_setup: false,
            support_phone_number: None,
            support_email_address: None,
            department: None,
            org_magic: String::new(),
            language: String::new(),
            region: String::new(),
            skip_setup_items: Vec::new(),
            configuration_web_url: String::new(),
            devices: Vec::new(),
        }
    }
}

/// Response to `POST /profile`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub profile_uuid: String,
    #[serde(default)]
    pub devices: HashMap<String, String>,
}

/// Response to `PUT /profile/devices`
///
/// `devices` maps each serial to a result string such as `SUCCESS`,
/// `NOT_ACCESSIBLE` or `FAILED`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignProfileResponse {
    #[serde(default)]
    pub profile_uuid: String,
    #[serde(default)]
    pub devices: HashMap<String, String>,
}

/// Request body for the profile assignment endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AssignProfileRequest<'a> {
    pub profile_uuid: &'a str,
    pub devices: &'a [String],
}

/// Request body shared by the fetch and sync endpoints
#[derive(Debug, Clone, Serialize)]
pub struct CursorRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<&'a str>,
    pub limit: u32,
}

/// A device record from the fetch or sync endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub serial_number: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub color: String,

    #[serde(default)]
    pub asset_tag: String,

    #[serde(default)]
    pub profile_status: String,

    #[serde(default)]
    pub profile_uuid: String,

    #[serde(default)]
    pub profile_assign_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub profile_push_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub device_assigned_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub device_assigned_by: String,

    #[serde(default)]
    pub os: String,

    #[serde(default)]
    pub device_family: String,

    /// Only set by the sync endpoint: `added`, `modified` or `deleted`
    #[serde(default)]
    pub op_type: String,

    #[serde(default)]
    pub op_date: Option<DateTime<Utc>>,
}

impl Device {
    /// Convenience constructor used heavily in tests
    pub fn new(serial_number: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    /// Host platform derived from the device family
    pub fn platform(&self) -> &'static str {
        match self.device_family.to_lowercase().as_str() {
            "iphone" => "ios",
            "ipad" => "ipados",
            _ => "darwin",
        }
    }
}

/// A page of devices from the fetch or sync endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceResponse {
    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub cursor: String,

    #[serde(default)]
    pub fetched_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub more_to_follow: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_not_signed_classification() {
        assert!(Error::from_response(403, "T_C_NOT_SIGNED").is_terms_not_signed());
        assert!(Error::from_response(403, "\"T_C_NOT_SIGNED\"\n").is_terms_not_signed());
        // Same token with a different status is not the terms condition
        assert!(!Error::from_response(400, "T_C_NOT_SIGNED").is_terms_not_signed());
    }

    #[test]
    fn test_cursor_classification() {
        assert!(Error::from_response(400, "EXHAUSTED_CURSOR").is_cursor_exhausted());
        assert!(Error::from_response(400, "INVALID_CURSOR").is_cursor_unusable());
        assert!(Error::from_response(400, "EXPIRED_CURSOR").is_cursor_unusable());

        match Error::from_response(500, "boom") {
            Error::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_profile_mdm_removable_defaults_true() {
        let profile: Profile = serde_json::from_str(r#"{"profile_name": "x"}"#).unwrap();
        assert!(profile.is_mdm_removable);

        let profile: Profile =
            serde_json::from_str(r#"{"profile_name": "x", "is_mdm_removable": false}"#).unwrap();
        assert!(!profile.is_mdm_removable);
    }

    #[test]
    fn test_device_response_parsing() {
        let body = r#"{
            "devices": [
                {"serial_number": "C02XYZ", "device_family": "Mac", "op_type": "added",
                 "op_date": "2024-03-18T18:42:48Z"},
                {"serial_number": "DMP123", "device_family": "iPad"}
            ],
            "cursor": "MTIzNDU2Nzg5MDEyMzQ1Njc4OTAxMjM0",
            "more_to_follow": true
        }"#;

        let resp: DeviceResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.devices.len(), 2);
        assert!(resp.more_to_follow);
        assert_eq!(resp.devices[0].platform(), "darwin");
        assert!(resp.devices[0].op_date.is_some());
        assert_eq!(resp.devices[1].platform(), "ipados");
        assert_eq!(resp.devices[1].op_type, "");
    }

    #[test]
    fn test_cursor_request_omits_empty_cursor() {
        let body = serde_json::to_string(&CursorRequest {
            cursor: None,
            limit: 100,
        })
        .unwrap();
        assert_eq!(body, r#"{"limit":100}"#);
    }
}
