//! DEP device fetch/sync cursor protocol
//!
//! DEP exposes the device list through two cursor-based endpoints:
//!
//! - **fetch** pages through every device assigned to the server. It starts
//!   without a cursor and ends when `more_to_follow` is false (or DEP
//!   answers "cursor exhausted").
//! - **sync** returns the device events since a cursor obtained from fetch.
//!
//! [`DeviceSyncer`] runs one pass of that protocol, handing each page to a
//! [`PageHandler`] and storing the page's cursor only once the handler is
//! done with it. A page whose handling failed is therefore requested again
//! on the next pass.

use super::DepApi;
use crate::datastore::CursorStorage;
use crate::integrations::retry::{with_retry, RetryConfig};
use crate::{AssignerError, Result, ResultExt};
use async_trait::async_trait;
use depapi::DeviceResponse;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives every page the syncer reads
#[async_trait]
pub trait PageHandler: Send + Sync {
    /// Handle one page. Returns the non-fatal errors recorded while handling
    /// it; an `Err` aborts the pass before the page's cursor is stored.
    async fn handle_page(&self, is_fetch: bool, page: &DeviceResponse) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Devices per page
    pub limit: u32,
    /// Backoff for transient page request failures
    pub retry: RetryConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            limit: depapi::DEFAULT_PAGE_LIMIT,
            retry: RetryConfig::default(),
        }
    }
}

/// Counters for one syncer pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub fetch_pages: usize,
    pub sync_pages: usize,
    pub devices_seen: usize,
    /// Times the cursor was rejected and the pass restarted from a full fetch
    pub cursor_restarts: usize,
    /// Non-fatal errors reported by the page handler
    pub errors: Vec<String>,
}

impl SyncSummary {
    pub fn pages(&self) -> usize {
        self.fetch_pages + self.sync_pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fetch,
    Sync,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Fetch => write!(f, "fetch"),
            Phase::Sync => write!(f, "sync"),
        }
    }
}

pub struct DeviceSyncer {
    name: String,
    client: Arc<dyn DepApi>,
    cursors: Arc<dyn CursorStorage>,
    handler: Arc<dyn PageHandler>,
    options: SyncOptions,
}

impl DeviceSyncer {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn DepApi>,
        cursors: Arc<dyn CursorStorage>,
        handler: Arc<dyn PageHandler>,
        options: SyncOptions,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            cursors,
            handler,
            options,
        }
    }

    /// Run fetch (if there is no cursor yet) then sync until DEP has nothing
    /// more to send
    pub async fn run(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        let mut cursor = self
            .cursors
            .retrieve_cursor(&self.name)
            .await
            .context("retrieve DEP cursor")?
            .token;
        let mut phase = if cursor.is_empty() {
            Phase::Fetch
        } else {
            Phase::Sync
        };
        debug!(name = %self.name, phase = %phase, "Starting device sync");

        loop {
            let page = match self.request_page(phase, &cursor).await {
                Ok(page) => page,
                Err(e) if phase == Phase::Fetch && e.is_cursor_exhausted() => {
                    debug!("Fetch cursor exhausted, switching to sync");
                    if cursor.is_empty() {
                        break;
                    }
                    phase = Phase::Sync;
                    continue;
                }
                Err(e) if e.is_cursor_unusable() => {
                    if summary.cursor_restarts > 0 {
                        return Err(AssignerError::from(e)
                            .context("DEP rejected the cursor again after a full restart"));
                    }
                    warn!(error = %e, "DEP rejected the cursor, restarting from a full fetch");
                    summary.cursor_restarts += 1;
                    self.cursors
                        .store_cursor(&self.name, "")
                        .await
                        .context("clear DEP cursor")?;
                    cursor.clear();
                    phase = Phase::Fetch;
                    continue;
                }
                Err(e) => {
                    return Err(AssignerError::from(e).context(format!("{} devices", phase)));
                }
            };

            match phase {
                Phase::Fetch => summary.fetch_pages += 1,
                Phase::Sync => summary.sync_pages += 1,
            }
            summary.devices_seen += page.devices.len();

            let errors = self
                .handler
                .handle_page(phase == Phase::Fetch, &page)
                .await?;
            summary.errors.extend(errors);

            if !page.cursor.is_empty() {
                self.cursors
                    .store_cursor(&self.name, &page.cursor)
                    .await
                    .context("store DEP cursor")?;
                cursor = page.cursor;
            }

            if page.more_to_follow {
                continue;
            }
            match phase {
                Phase::Fetch if !cursor.is_empty() => phase = Phase::Sync,
                _ => break,
            }
        }

        info!(
            fetch_pages = summary.fetch_pages,
            sync_pages = summary.sync_pages,
            devices = summary.devices_seen,
            "Device sync finished"
        );
        Ok(summary)
    }

    async fn request_page(&self, phase: Phase, cursor: &str) -> depapi::Result<DeviceResponse> {
        let limit = self.options.limit;
        let operation = match phase {
            Phase::Fetch => "fetch_devices",
            Phase::Sync => "sync_devices",
        };

        with_retry(&self.options.retry, operation, || async move {
            match phase {
                Phase::Fetch => {
                    let cursor = (!cursor.is_empty()).then_some(cursor);
                    self.client.fetch_devices(cursor, limit).await
                }
                Phase::Sync => self.client.sync_devices(cursor, limit).await,
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dep::testing::{page, FakeDepClient, MemoryCursors};
    use chrono::Utc;
    use depapi::Device;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records pages and fails on demand
    #[derive(Default)]
    struct RecordingHandler {
        pages: Mutex<Vec<(bool, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl PageHandler for RecordingHandler {
        async fn handle_page(&self, is_fetch: bool, page: &DeviceResponse) -> Result<Vec<String>> {
            if self.fail {
                return Err(AssignerError::Other("handler failed".into()));
            }
            let serials = page.devices.iter().map(|d| d.serial_number.clone()).collect();
            self.pages.lock().unwrap().push((is_fetch, serials));
            Ok(Vec::new())
        }
    }

    fn options() -> SyncOptions {
        SyncOptions {
            limit: 2,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        }
    }

    fn syncer(
        client: Arc<FakeDepClient>,
        cursors: Arc<MemoryCursors>,
        handler: Arc<RecordingHandler>,
    ) -> DeviceSyncer {
        DeviceSyncer::new("test", client, cursors, handler, options())
    }

    #[tokio::test]
    async fn test_fetch_then_sync() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::default());
        let handler = Arc::new(RecordingHandler::default());

        client.push_fetch(Ok(page(vec![Device::new("A", ""), Device::new("B", "")], "c1", true)));
        client.push_fetch(Ok(page(vec![Device::new("C", "")], "c2", false)));
        client.push_sync(Ok(page(vec![Device::new("D", "added")], "c3", false)));

        let summary = syncer(client.clone(), cursors.clone(), handler.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.fetch_pages, 2);
        assert_eq!(summary.sync_pages, 1);
        assert_eq!(summary.devices_seen, 4);
        assert_eq!(client.fetch_calls(), vec![None, Some("c1".to_string())]);
        assert_eq!(client.sync_calls(), vec!["c2".to_string()]);
        assert_eq!(cursors.stores(), vec!["c1", "c2", "c3"]);

        let pages = handler.pages.lock().unwrap().clone();
        assert_eq!(pages[0], (true, vec!["A".to_string(), "B".to_string()]));
        assert_eq!(pages[2], (false, vec!["D".to_string()]));
    }

    #[tokio::test]
    async fn test_existing_cursor_starts_in_sync() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::with_cursor("test", "c9", Utc::now()));
        let handler = Arc::new(RecordingHandler::default());

        syncer(client.clone(), cursors, handler).run().await.unwrap();

        assert!(client.fetch_calls().is_empty());
        assert_eq!(client.sync_calls(), vec!["c9".to_string()]);
    }

    #[tokio::test]
    async fn test_cursor_not_stored_when_handler_fails() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::default());
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });

        client.push_fetch(Ok(page(vec![Device::new("A", "")], "c1", false)));

        let err = syncer(client, cursors.clone(), handler).run().await.unwrap_err();
        assert!(err.to_string().contains("handler failed"));
        assert!(cursors.stores().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_cursor_moves_to_sync() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::default());
        let handler = Arc::new(RecordingHandler::default());

        client.push_fetch(Ok(page(vec![Device::new("A", "")], "c1", true)));
        client.push_fetch(Err(depapi::Error::CursorExhausted));

        let summary = syncer(client.clone(), cursors.clone(), handler)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.fetch_pages, 1);
        assert_eq!(client.sync_calls(), vec!["c1".to_string()]);
        assert_eq!(cursors.current("test"), "c1");
    }

    #[tokio::test]
    async fn test_invalid_cursor_restarts_once() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::with_cursor("test", "stale", Utc::now()));
        let handler = Arc::new(RecordingHandler::default());

        client.push_sync(Err(depapi::Error::CursorExpired));
        client.push_fetch(Ok(page(vec![Device::new("A", "")], "fresh", false)));

        let summary = syncer(client.clone(), cursors.clone(), handler)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.cursor_restarts, 1);
        assert_eq!(client.fetch_calls(), vec![None]);
        assert_eq!(client.sync_calls(), vec!["stale".to_string(), "fresh".to_string()]);
        assert_eq!(cursors.stores(), vec!["", "fresh"]);
    }

    #[tokio::test]
    async fn test_invalid_cursor_twice_fails() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::with_cursor("test", "stale", Utc::now()));
        let handler = Arc::new(RecordingHandler::default());

        client.push_sync(Err(depapi::Error::CursorInvalid));
        client.push_fetch(Ok(page(vec![], "fresh", false)));
        client.push_sync(Err(depapi::Error::CursorInvalid));

        let err = syncer(client, cursors, handler).run().await.unwrap_err();
        assert!(matches!(err.as_dep(), Some(depapi::Error::CursorInvalid)));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::default());
        let handler = Arc::new(RecordingHandler::default());

        client.push_fetch(Err(depapi::Error::Transport("connection reset".into())));
        client.push_fetch(Err(depapi::Error::Http {
            status: 503,
            body: String::new(),
        }));
        client.push_fetch(Ok(page(vec![Device::new("A", "")], "c1", false)));

        let summary = syncer(client.clone(), cursors, handler).run().await.unwrap();
        assert_eq!(summary.fetch_pages, 1);
        assert_eq!(client.fetch_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_terms_not_signed_is_not_retried() {
        let client = Arc::new(FakeDepClient::new());
        let cursors = Arc::new(MemoryCursors::default());
        let handler = Arc::new(RecordingHandler::default());

        client.push_fetch(Err(depapi::Error::TermsNotSigned));

        let err = syncer(client.clone(), cursors, handler).run().await.unwrap_err();
        assert!(err.is_terms_not_signed());
        assert_eq!(client.fetch_calls().len(), 1);
    }
}
