//! Settings validation.

use crate::config::settings::Settings;
use crate::error::ConfigError;

/// Validate every settings field.
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.workspace_root.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "workspace_root cannot be empty".to_string(),
        ));
    }

    if settings.max_concurrent_builds == 0 {
        return Err(ConfigError::ValidationFailed(
            "max_concurrent_builds must be at least 1".to_string(),
        ));
    }

    if settings.jobs == 0 {
        return Err(ConfigError::ValidationFailed(
            "jobs must be at least 1".to_string(),
        ));
    }

    if settings.log_tail_lines == 0 {
        return Err(ConfigError::ValidationFailed(
            "log_tail_lines must be at least 1".to_string(),
        ));
    }

    for (stage, seconds) in settings.timeouts.all() {
        if seconds == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "timeouts.{} must be greater than zero",
                stage
            )));
        }
    }

    if let Some(tool) = settings.required_tools.iter().find(|t| t.trim().is_empty()) {
        return Err(ConfigError::ValidationFailed(format!(
            "required_tools contains an empty entry: '{}'",
            tool
        )));
    }

    Ok(())
}
