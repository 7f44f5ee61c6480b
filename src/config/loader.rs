//! Settings file loader and serialization.

use crate::config::settings::Settings;
use crate::error::ConfigError;
use std::fs;
use std::path::Path;

/// Load settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    validate_settings_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!("Settings file not found at: {}", path.display()))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings, falling back to defaults when the file does not exist.
/// A file that exists but does not parse is still an error.
pub fn load_or_default(path: &Path) -> Result<Settings, ConfigError> {
    match load_settings(path) {
        Ok(settings) => Ok(settings),
        Err(ConfigError::FileNotFound(_)) => {
            log::debug!(
                "[Config] No settings at {}, using defaults",
                path.display()
            );
            Ok(Settings::default())
        }
        Err(e) => Err(e),
    }
}

/// Save settings as TOML, creating the parent directory.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<(), ConfigError> {
    validate_settings_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Settings path must be non-empty and end in `.toml`.
pub fn validate_settings_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Settings path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "toml" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Settings file must have .toml extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Settings file must have .toml extension".to_string(),
        )),
    }
}
