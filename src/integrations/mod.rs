//! External service adapters
//!
//! - [`AppleDepClient`]: the DEP REST API over `reqwest`
//! - [`retry`]: backoff for transient DEP failures

pub mod apple_dep;
pub mod retry;

pub use apple_dep::{AppleDepClient, DEFAULT_BASE_URL};
pub use retry::{with_retry, RetryConfig, RetryDecision, RetryableError};
