//! Recovery Builder
//!
//! Orchestrates builds of custom Android recovery images (TWRP and Orange Fox)
//! for a database of known devices. A build request is validated into a
//! `BuildConfig`, executed as a `BuildRun` through a fixed sequence of stages,
//! and finalized into checksummed artifacts, a JSON build report and
//! cross-run statistics.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Flavors, build options, stage outcomes, artifacts
//! - **devices**: Versioned device registry and roomservice manifests
//! - **workspace**: On-disk layout and path resolution
//! - **config**: Build configuration and orchestrator settings
//! - **log_collector**: Append-only, non-blocking build logs
//! - **orchestrator**: Admission, stage pipeline and external tool execution
//! - **artifacts**: Checksums, packaging, reports and statistics

pub mod artifacts;
pub mod config;
pub mod devices;
pub mod error;
pub mod log_collector;
pub mod models;
pub mod orchestrator;
pub mod workspace;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    ArtifactError, BuildError, ConfigError, OrchestratorError, Result, SubmitError,
    ValidationError,
};

pub use models::{Artifact, ArtifactKind, BuildOption, BuildOutcome, RecoveryFlavor, StageStatus};

pub use artifacts::{ArtifactFilter, BuildReport, Statistics};
pub use config::{BuildConfig, Settings, StageTimeouts};
pub use devices::{DeviceInfo, DeviceRegistry, DeviceSummary};
pub use workspace::{Workspace, WorkspaceDir};

pub use orchestrator::{
    BuildEvent, BuildHandle, BuildStage, Orchestrator, ProcessToolchain, RunStatus, Toolchain,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
