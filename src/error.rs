//! Error types for dep-assigner
//!
//! One error enum covers the datastore, the DEP API and configuration.
//! Boundary errors are wrapped with an operation description via
//! [`ResultExt::context`]; the wrapped structure is kept so callers can still
//! ask [`AssignerError::is_not_found`] or [`AssignerError::is_terms_not_signed`]
//! after any number of wraps.

use thiserror::Error;

/// Result type alias for dep-assigner operations
pub type Result<T> = std::result::Result<T, AssignerError>;

#[derive(Error, Debug)]
pub enum AssignerError {
    /// An expected row is absent. Often a legitimate state.
    #[error("{0} not found")]
    NotFound(String),

    /// Error returned by the DEP service or while talking to it
    #[error(transparent)]
    Dep(#[from] depapi::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An inner error tagged with the operation that failed
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AssignerError>,
    },

    #[error("{0}")]
    Other(String),
}

impl AssignerError {
    /// Tag this error with the operation that produced it
    pub fn context(self, context: impl Into<String>) -> Self {
        AssignerError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, below every context wrap
    pub fn root(&self) -> &AssignerError {
        let mut err = self;
        while let AssignerError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            AssignerError::NotFound(_) => true,
            AssignerError::Database(rusqlite::Error::QueryReturnedNoRows) => true,
            _ => false,
        }
    }

    pub fn is_terms_not_signed(&self) -> bool {
        matches!(self.root(), AssignerError::Dep(e) if e.is_terms_not_signed())
    }

    /// The DEP error at the root, if any
    pub fn as_dep(&self) -> Option<&depapi::Error> {
        match self.root() {
            AssignerError::Dep(e) => Some(e),
            _ => None,
        }
    }
}

/// Attach an operation description to any error convertible into
/// [`AssignerError`]
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<AssignerError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}
