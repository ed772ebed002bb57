//! Configuration validation
//!
//! Checks an [`AssignerConfig`] before a pass runs:
//! - server and DEP URLs are http(s)
//! - page limit within what DEP accepts
//! - non-zero daemon interval
//! - a session token variable is named

use super::assigner_config::AssignerConfig;
use crate::AssignerError;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a configuration, collecting every problem
pub fn validate_config(config: &AssignerConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if !is_http_url(&config.server_url) {
        errors.push(ValidationError::new(
            "server_url",
            format!("Must be an http(s) URL, got '{}'", config.server_url),
        ));
    }

    if !is_http_url(&config.dep.base_url) {
        errors.push(ValidationError::new(
            "dep.base_url",
            format!("Must be an http(s) URL, got '{}'", config.dep.base_url),
        ));
    }

    if !(1..=depapi::MAX_PAGE_LIMIT).contains(&config.dep.page_limit) {
        errors.push(ValidationError::new(
            "dep.page_limit",
            format!(
                "Must be between 1 and {}, got {}",
                depapi::MAX_PAGE_LIMIT,
                config.dep.page_limit
            ),
        ));
    }

    if config.dep.session_token_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "dep.session_token_env",
            "Name of the environment variable holding the DEP session token is required",
        ));
    }

    if config.daemon.interval_secs == 0 {
        errors.push(ValidationError::new(
            "daemon.interval_secs",
            "Interval must be greater than 0",
        ));
    }

    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        errors.push(ValidationError::new(
            "retry.initial_backoff_ms",
            "Initial backoff cannot exceed max_backoff_ms",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_http_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some(),
        Err(_) => false,
    }
}

/// Validate and fold all problems into one [`AssignerError::Config`]
pub fn validate_config_result(config: &AssignerConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        AssignerError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(config: &AssignerConfig) -> Vec<String> {
        validate_config(config)
            .unwrap_err()
            .into_iter()
            .map(|e| e.field)
            .collect()
    }

    #[test]
    fn test_valid_config() {
        let config = AssignerConfig::new("https://mdm.example.com");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_server_url() {
        let config = AssignerConfig::new("mdm.example.com");
        assert_eq!(fields(&config), vec!["server_url"]);

        let config = AssignerConfig::new("ftp://mdm.example.com");
        assert_eq!(fields(&config), vec!["server_url"]);
    }

    #[test]
    fn test_page_limit_bounds() {
        let mut config = AssignerConfig::new("https://mdm.example.com");
        config.dep.page_limit = 0;
        assert_eq!(fields(&config), vec!["dep.page_limit"]);

        config.dep.page_limit = 1000;
        assert!(validate_config(&config).is_ok());

        config.dep.page_limit = 1001;
        assert_eq!(fields(&config), vec!["dep.page_limit"]);
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = AssignerConfig::new("");
        config.daemon.interval_secs = 0;
        config.dep.session_token_env = " ".to_string();

        let errors = fields(&config);
        assert!(errors.contains(&"server_url".to_string()));
        assert!(errors.contains(&"daemon.interval_secs".to_string()));
        assert!(errors.contains(&"dep.session_token_env".to_string()));
    }

    #[test]
    fn test_validate_config_result_message() {
        let config = AssignerConfig::new("nope");
        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("server_url"));
    }
}
