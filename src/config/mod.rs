//! Configuration system
//!
//! Loads ~/.config/dep-assigner/config.yaml:
//! - Server URL, DEP default team and end-user authentication, which seed
//!   the persisted app config
//! - Database location
//! - DEP endpoint, session token variable and page size
//! - Retry backoff and daemon interval

mod assigner_config;
pub mod validation;

pub use assigner_config::{AssignerConfig, DaemonSettings, DepSettings, RetrySettings};
pub use validation::{validate_config, validate_config_result, ValidationError};
