//! Unified error type hierarchy for the recovery builder
//!
//! Provides structured error handling with ValidationError, BuildError,
//! SubmitError, OrchestratorError, ConfigError, and ArtifactError.

use std::io;
use thiserror::Error;

use crate::models::RecoveryFlavor;
use crate::orchestrator::state::BuildStage;

/// Rejections raised before any BuildRun exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Device not found: {0}")]
    UnknownDevice(String),

    #[error("Unknown recovery flavor: {0}")]
    UnknownFlavor(String),

    #[error("Device {device} does not support {flavor}: {reason}")]
    IncompatibleFlavor {
        device: String,
        flavor: RecoveryFlavor,
        reason: String,
    },

    #[error("Invalid {flavor} version '{version}': {reason}")]
    InvalidVersion {
        flavor: RecoveryFlavor,
        version: String,
        reason: String,
    },

    #[error("Unrecognized build option: {0}")]
    UnrecognizedOption(String),

    #[error("Device already registered: {0}")]
    DuplicateDevice(String),

    #[error("Invalid device record: {0}")]
    InvalidDevice(String),
}

/// Failures captured inside a BuildRun. Never returned to the submitter directly;
/// they end up in the stage log, the status query and the build report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Compatibility check failed: {0}")]
    Compatibility(String),

    #[error("Stage {stage} timed out after {seconds}s")]
    StageTimeout { stage: BuildStage, seconds: u64 },

    #[error("Stage {stage} failed: {message}")]
    StageFailure { stage: BuildStage, message: String },

    #[error("Workspace resource error: {0}")]
    Resource(String),

    #[error("Build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Stable tag written into reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Compatibility(_) => "compatibility",
            BuildError::StageTimeout { .. } => "stage_timeout",
            BuildError::StageFailure { .. } => "stage_failure",
            BuildError::Resource(_) => "resource",
            BuildError::Cancelled => "cancelled",
        }
    }
}

impl From<io::Error> for BuildError {
    fn from(e: io::Error) -> Self {
        BuildError::Resource(e.to_string())
    }
}

impl From<ArtifactError> for BuildError {
    fn from(e: ArtifactError) -> Self {
        BuildError::Resource(e.to_string())
    }
}

/// Errors returned synchronously by `Orchestrator::submit`.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("A build with fingerprint {fingerprint} is already running as {run_id}")]
    DuplicateRun { fingerprint: String, run_id: String },

    #[error("Workspace unavailable: {0}")]
    Resource(String),
}

/// Errors from the query side of the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Build run not found: {0}")]
    RunNotFound(String),

    #[error(transparent)]
    Registry(#[from] ValidationError),

    #[error("Artifact store error: {0}")]
    Artifacts(#[from] ArtifactError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Settings file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid TOML in settings: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Artifact, report and statistics persistence errors.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Report serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Expected artifact missing: {0}")]
    Missing(String),

    #[error("Artifact already exists: {0}")]
    Exists(String),
}

impl From<zip::result::ZipError> for ArtifactError {
    fn from(e: zip::result::ZipError) -> Self {
        ArtifactError::Archive(e.to_string())
    }
}

impl From<tempfile::PersistError> for ArtifactError {
    fn from(e: tempfile::PersistError) -> Self {
        ArtifactError::Io(e.error)
    }
}

/// Top-level result type for the binary and ad hoc callers.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
