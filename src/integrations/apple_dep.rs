//! Apple DEP HTTP client
//!
//! Talks to the DEP service (`mdmenrollment.apple.com`) with an already
//! obtained session token.

use crate::config::DepSettings;
use crate::dep::DepApi;
use crate::{AssignerError, Result};
use async_trait::async_trait;
use depapi::{
    AssignProfileRequest, AssignProfileResponse, CursorRequest, DeviceResponse, Profile,
    ProfileResponse,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Apple's production DEP endpoint
pub const DEFAULT_BASE_URL: &str = "https://mdmenrollment.apple.com";

const SESSION_HEADER: &str = "X-ADM-Auth-Session";
const PROTOCOL_VERSION_HEADER: &str = "X-Server-Protocol-Version";
const PROTOCOL_VERSION: &str = "3";

/// Per-request timeout for device list pages
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for profile define/assign
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct AppleDepClient {
    client: Client,
    base_url: String,
    session_token: String,
}

impl AppleDepClient {
    pub fn new(base_url: &str, session_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(PAGE_TIMEOUT)
            .user_agent(concat!("dep-assigner/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token: session_token.into(),
        })
    }

    /// Build a client from config, reading the session token from the
    /// configured environment variable
    pub fn from_settings(settings: &DepSettings) -> Result<Self> {
        let env_var = settings.session_token_env.trim_start_matches('$');
        let token = std::env::var(env_var).map_err(|_| {
            AssignerError::Config(format!(
                "DEP session token not set (expected in ${})",
                env_var
            ))
        })?;
        Self::new(&settings.base_url, token)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.session_token)
            .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .timeout(timeout)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> depapi::Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| depapi::Error::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| depapi::Error::Transport(e.to_string()))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), body = %body, "DEP request failed");
            return Err(depapi::Error::from_response(status.as_u16(), &body));
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl DepApi for AppleDepClient {
    async fn fetch_devices(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> depapi::Result<DeviceResponse> {
        let request = self
            .request(Method::POST, "/server/devices", PAGE_TIMEOUT)
            .json(&CursorRequest { cursor, limit });
        self.send(request).await
    }

    async fn sync_devices(&self, cursor: &str, limit: u32) -> depapi::Result<DeviceResponse> {
        let request = self
            .request(Method::POST, "/devices/sync", PAGE_TIMEOUT)
            .json(&CursorRequest {
                cursor: Some(cursor),
                limit,
            });
        self.send(request).await
    }

    async fn define_profile(&self, profile: &Profile) -> depapi::Result<ProfileResponse> {
        let request = self
            .request(Method::POST, "/profile", WRITE_TIMEOUT)
            .json(profile);
        self.send(request).await
    }

    async fn assign_profile(
        &self,
        profile_uuid: &str,
        serials: &[String],
    ) -> depapi::Result<AssignProfileResponse> {
        let request = self
            .request(Method::PUT, "/profile/devices", WRITE_TIMEOUT)
            .json(&AssignProfileRequest {
                profile_uuid,
                devices: serials,
            });
        self.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            // Read headers, then as much body as Content-Length announces
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_fetch_devices_request() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"devices": [{"serial_number": "C02X", "op_type": ""}], "cursor": "c1", "more_to_follow": true}"#,
        )
        .await;
        let client = AppleDepClient::new(&url, "session-abc").unwrap();

        let page = client.fetch_devices(None, 100).await.unwrap();
        assert_eq!(page.devices[0].serial_number, "C02X");
        assert_eq!(page.cursor, "c1");
        assert!(page.more_to_follow);

        let request = server.await.unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /server/devices HTTP/1.1"));
        assert!(lower.contains("x-adm-auth-session: session-abc"));
        assert!(lower.contains("x-server-protocol-version: 3"));
        assert!(request.contains(r#""limit":100"#));
        assert!(!request.contains("cursor"));
    }

    #[tokio::test]
    async fn test_assign_profile_request() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"profile_uuid": "p1", "devices": {"S1": "SUCCESS"}}"#,
        )
        .await;
        let client = AppleDepClient::new(&url, "t").unwrap();

        let resp = client
            .assign_profile("p1", &["S1".to_string()])
            .await
            .unwrap();
        assert_eq!(resp.devices.get("S1").map(String::as_str), Some("SUCCESS"));

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /profile/devices HTTP/1.1"));
        assert!(request.contains(r#""profile_uuid":"p1""#));
        assert!(request.contains(r#""devices":["S1"]"#));
    }

    #[tokio::test]
    async fn test_terms_not_signed_response() {
        let (url, _server) = serve_once("403 Forbidden", "T_C_NOT_SIGNED").await;
        let client = AppleDepClient::new(&url, "t").unwrap();

        let err = client.define_profile(&Profile::default()).await.unwrap_err();
        assert!(err.is_terms_not_signed());
    }

    #[tokio::test]
    async fn test_exhausted_cursor_response() {
        let (url, _server) = serve_once("400 Bad Request", "\"EXHAUSTED_CURSOR\"").await;
        let client = AppleDepClient::new(&url, "t").unwrap();

        let err = client.fetch_devices(Some("c1"), 10).await.unwrap_err();
        assert!(err.is_cursor_exhausted());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = AppleDepClient::new(&format!("http://{}", addr), "t").unwrap();
        let err = client.sync_devices("c1", 10).await.unwrap_err();
        assert!(matches!(err, depapi::Error::Transport(_)));
    }

    #[test]
    fn test_from_settings_requires_token() {
        let settings = DepSettings {
            session_token_env: "DEP_ASSIGNER_TEST_UNSET_TOKEN".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            AppleDepClient::from_settings(&settings),
            Err(AssignerError::Config(_))
        ));
    }
}
