//! dep-assigner - Apple DEP device reconciliation and profile assignment
//!
//! Keeps an MDM server's view of its Apple Business Manager devices current
//! and makes sure every device DEP reports is assigned an enrollment profile.
//!
//! # Architecture
//!
//! - **dep**: Assigner core (profile registration, device reconciliation,
//!   cursor-driven sync, terms-of-service gate)
//! - **datastore**: Persistence traits and the SQLite implementation
//! - **integrations**: Apple DEP HTTP client and retry policy
//! - **daemon**: Periodic pass scheduler
//! - **config**: Service configuration (YAML)
//! - **model**: Records shared by the datastore and the assigner
//! - **metrics**: Prometheus counters for passes and assignments

// Core modules
pub mod config;
pub mod datastore;
pub mod dep;
pub mod error;
pub mod model;

// Components
pub mod daemon;
pub mod integrations;
pub mod logging;
pub mod metrics;

// Re-exports
pub use error::{AssignerError, Result, ResultExt};
