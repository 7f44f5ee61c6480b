//! Core data types for the recovery builder.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ValidationError;

static TWRP_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+_(\d+)$").expect("static regex"));
static ORANGE_FOX_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+$").expect("static regex"));

/// Supported recovery families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryFlavor {
    Twrp,
    OrangeFox,
}

impl RecoveryFlavor {
    pub const ALL: [RecoveryFlavor; 2] = [RecoveryFlavor::Twrp, RecoveryFlavor::OrangeFox];

    /// Slug used in paths and artifact names (`twrp`, `orange_fox`).
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryFlavor::Twrp => "twrp",
            RecoveryFlavor::OrangeFox => "orange_fox",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RecoveryFlavor::Twrp => "TWRP",
            RecoveryFlavor::OrangeFox => "Orange Fox",
        }
    }

    /// Platform manifest the flavor is synced from.
    pub fn manifest_url(&self) -> &'static str {
        match self {
            RecoveryFlavor::Twrp => {
                "https://github.com/minimal-manifest-twrp/platform_manifest_twrp_aosp.git"
            }
            RecoveryFlavor::OrangeFox => "https://gitlab.com/OrangeFox/sync.git",
        }
    }

    /// Build-system variables that identify the flavor to the device makefiles.
    pub fn version_env(&self, version: &str) -> Vec<(&'static str, String)> {
        match self {
            RecoveryFlavor::Twrp => vec![("TW_DEVICE_VERSION", version.to_string())],
            RecoveryFlavor::OrangeFox => vec![
                ("FOX_VERSION", version.to_string()),
                ("FOX_BUILD_TYPE", "Unofficial".to_string()),
                ("OF_MAINTAINER", "Recovery-Builder".to_string()),
                ("OF_DISABLE_RECOVERY_MEDIA", "1".to_string()),
                ("OF_USE_TWRP_SHELL", "1".to_string()),
            ],
        }
    }

    /// Check a version pin against the flavor's grammar.
    pub fn validate_version(&self, version: &str) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidVersion {
            flavor: *self,
            version: version.to_string(),
            reason: reason.to_string(),
        };

        if version.trim().is_empty() {
            return Err(invalid("version must not be empty"));
        }
        if version.contains('/') || version.contains('\\') {
            return Err(invalid("version must not contain path separators"));
        }

        let matches = match self {
            RecoveryFlavor::Twrp => TWRP_VERSION.is_match(version),
            RecoveryFlavor::OrangeFox => ORANGE_FOX_VERSION.is_match(version),
        };
        if !matches {
            let expected = match self {
                RecoveryFlavor::Twrp => "expected <major>.<minor>.<patch>_<android>, e.g. 3.7.0_12",
                RecoveryFlavor::OrangeFox => "expected <major>.<minor>, e.g. 12.1",
            };
            return Err(invalid(expected));
        }
        Ok(())
    }

    /// Manifest branch for a validated version pin.
    ///
    /// TWRP branches track the Android release encoded after the underscore
    /// (`3.7.0_12` -> `twrp-12.1`); Orange Fox branches are `fox_<version>`.
    pub fn manifest_branch(&self, version: &str) -> String {
        match self {
            RecoveryFlavor::Twrp => {
                let android = TWRP_VERSION
                    .captures(version)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str())
                    .unwrap_or("12");
                format!("twrp-{}.1", android)
            }
            RecoveryFlavor::OrangeFox => format!("fox_{}", version),
        }
    }
}

impl fmt::Display for RecoveryFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for RecoveryFlavor {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect();
        match normalized.as_str() {
            "twrp" => Ok(RecoveryFlavor::Twrp),
            "orangefox" | "ofox" => Ok(RecoveryFlavor::OrangeFox),
            _ => Err(ValidationError::UnknownFlavor(s.to_string())),
        }
    }
}

/// Closed set of recognized build toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOption {
    /// Wipe the per-run output tree before compiling.
    CleanBuild,
    /// Route compilation through ccache rooted at `cache/ccache`.
    Ccache,
    /// Ask the external toolchain for verbose output.
    VerboseLogs,
}

impl BuildOption {
    pub const ALL: [BuildOption; 3] = [
        BuildOption::CleanBuild,
        BuildOption::Ccache,
        BuildOption::VerboseLogs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildOption::CleanBuild => "clean_build",
            BuildOption::Ccache => "ccache",
            BuildOption::VerboseLogs => "verbose_logs",
        }
    }
}

impl fmt::Display for BuildOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildOption {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildOption::ALL
            .iter()
            .copied()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| ValidationError::UnrecognizedOption(s.to_string()))
    }
}

/// Status of one stage entry in a run's stage log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    /// Cancellation was observed before the stage started.
    Cancelled,
}

/// Terminal result of a BuildRun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    Failed,
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildOutcome::Success => write!(f, "success"),
            BuildOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of produced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Archive,
    Log,
    Report,
}

/// A produced, checksummed file. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size: u64,
    pub sha256: String,
    pub build_run_id: String,
}

impl Artifact {
    /// File name component of the artifact path.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}
