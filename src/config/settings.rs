//! Orchestrator settings persisted as `recovery_builder.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::state::BuildStage;

/// Per-stage bounds, in seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub env_setup: u64,
    pub source_sync: u64,
    pub device_detect: u64,
    pub compile: u64,
    pub image_create: u64,
    pub package: u64,
    pub verify: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        StageTimeouts {
            env_setup: 600,
            source_sync: 4 * 60 * 60,
            device_detect: 120,
            compile: 6 * 60 * 60,
            image_create: 300,
            package: 300,
            verify: 300,
        }
    }
}

impl StageTimeouts {
    /// Same bound for every stage. Handy for tests.
    pub fn uniform(seconds: u64) -> Self {
        StageTimeouts {
            env_setup: seconds,
            source_sync: seconds,
            device_detect: seconds,
            compile: seconds,
            image_create: seconds,
            package: seconds,
            verify: seconds,
        }
    }

    pub(crate) fn all(&self) -> [(&'static str, u64); 7] {
        [
            ("env_setup", self.env_setup),
            ("source_sync", self.source_sync),
            ("device_detect", self.device_detect),
            ("compile", self.compile),
            ("image_create", self.image_create),
            ("package", self.package),
            ("verify", self.verify),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub workspace_root: PathBuf,
    /// Admission-control limit on simultaneously executing runs.
    pub max_concurrent_builds: usize,
    /// Extra SOURCE_SYNC attempts after a failed sync. Zero disables retry.
    pub sync_retries: u32,
    pub jobs: usize,
    pub log_tail_lines: usize,
    pub timeouts: StageTimeouts,
    pub required_tools: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let workspace_root = dirs::home_dir()
            .map(|home| home.join(".recovery_builder"))
            .unwrap_or_else(|| PathBuf::from(".recovery_builder"));
        Settings {
            workspace_root,
            max_concurrent_builds: 2,
            sync_retries: 0,
            jobs: num_cpus::get(),
            log_tail_lines: 200,
            timeouts: StageTimeouts::default(),
            required_tools: ["git", "repo", "make", "python3", "zip"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Settings {
    /// Default settings rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Settings {
            workspace_root: root.into(),
            ..Settings::default()
        }
    }

    /// Bound for one executing stage. QUEUED and terminal states are unbounded.
    pub fn stage_timeout(&self, stage: BuildStage) -> Option<Duration> {
        let seconds = match stage {
            BuildStage::EnvSetup => self.timeouts.env_setup,
            BuildStage::SourceSync => self.timeouts.source_sync,
            BuildStage::DeviceDetect => self.timeouts.device_detect,
            BuildStage::Compile => self.timeouts.compile,
            BuildStage::ImageCreate => self.timeouts.image_create,
            BuildStage::Package => self.timeouts.package,
            BuildStage::Verify => self.timeouts.verify,
            BuildStage::Queued | BuildStage::Done | BuildStage::Failed => return None,
        };
        Some(Duration::from_secs(seconds))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, crate::error::ConfigError> {
        super::loader::load_settings(path)
    }

    pub fn load_or_default(path: &std::path::Path) -> Result<Self, crate::error::ConfigError> {
        super::loader::load_or_default(path)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), crate::error::ConfigError> {
        super::loader::save_settings(self, path)
    }

    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        super::validator::validate_settings(self)
    }
}
