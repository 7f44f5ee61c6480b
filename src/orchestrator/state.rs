//! Build State Management and Stage Tracking
//!
//! **Architecture**:
//! - `BuildStage`: the strictly ordered stage machine, plus the `FAILED` terminal
//! - `BuildRun`: the mutable execution record, owned by the run's task until terminal
//! - `RunStatus`: the read-only view published to everyone else
//!
//! Stage sequence is monotonic. `BuildRun` only moves forward through
//! `valid_next_stages`, so an earlier stage is never revisited.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::models::{Artifact, BuildOutcome, RecoveryFlavor, StageStatus};

/// Stage enumeration - discrete states in the build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStage {
    /// Accepted, waiting for an admission slot
    Queued,

    /// Required tools present, build environment script written
    EnvSetup,

    /// Flavor manifest and device tree synced (resumable)
    SourceSync,

    /// Synced device tree re-validated against the flavor
    DeviceDetect,

    /// External compilation of the recovery image
    Compile,

    /// Recovery image extracted from build output
    ImageCreate,

    /// Flashable archive with metadata
    Package,

    /// Checksums and presence checks over all artifacts
    Verify,

    Done,

    Failed,
}

impl BuildStage {
    /// The executing stages, in order.
    pub const PIPELINE: [BuildStage; 7] = [
        BuildStage::EnvSetup,
        BuildStage::SourceSync,
        BuildStage::DeviceDetect,
        BuildStage::Compile,
        BuildStage::ImageCreate,
        BuildStage::Package,
        BuildStage::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Queued => "QUEUED",
            BuildStage::EnvSetup => "ENV_SETUP",
            BuildStage::SourceSync => "SOURCE_SYNC",
            BuildStage::DeviceDetect => "DEVICE_DETECT",
            BuildStage::Compile => "COMPILE",
            BuildStage::ImageCreate => "IMAGE_CREATE",
            BuildStage::Package => "PACKAGE",
            BuildStage::Verify => "VERIFY",
            BuildStage::Done => "DONE",
            BuildStage::Failed => "FAILED",
        }
    }

    /// Successor on the success path.
    pub fn next(&self) -> Option<BuildStage> {
        match self {
            BuildStage::Queued => Some(BuildStage::EnvSetup),
            BuildStage::EnvSetup => Some(BuildStage::SourceSync),
            BuildStage::SourceSync => Some(BuildStage::DeviceDetect),
            BuildStage::DeviceDetect => Some(BuildStage::Compile),
            BuildStage::Compile => Some(BuildStage::ImageCreate),
            BuildStage::ImageCreate => Some(BuildStage::Package),
            BuildStage::Package => Some(BuildStage::Verify),
            BuildStage::Verify => Some(BuildStage::Done),
            BuildStage::Done | BuildStage::Failed => None,
        }
    }

    /// All valid transitions FROM this stage.
    pub fn valid_next_stages(&self) -> Vec<BuildStage> {
        match self.next() {
            Some(next) => vec![next, BuildStage::Failed],
            None => vec![],
        }
    }

    pub fn can_transition_to(&self, next: BuildStage) -> bool {
        self.valid_next_stages().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStage::Done | BuildStage::Failed)
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a run's stage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: BuildStage,
    pub started_at: DateTime<Local>,
    pub ended_at: Option<DateTime<Local>>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made; above one only for retried SOURCE_SYNC.
    #[serde(default = "one")]
    pub attempts: u32,
}

fn one() -> u32 {
    1
}

impl StageRecord {
    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Mutable execution record for one build.
#[derive(Debug, Clone)]
pub struct BuildRun {
    pub id: String,
    pub config: BuildConfig,
    /// `YYYYMMDD_HHMMSS` stamp shared by every artifact of this run.
    pub timestamp: String,
    pub stage: BuildStage,
    pub submitted_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub stages: Vec<StageRecord>,
    pub outcome: Option<BuildOutcome>,
    pub failed_stage: Option<BuildStage>,
    pub error: Option<BuildError>,
    pub artifacts: Vec<Artifact>,
}

impl BuildRun {
    pub fn new(id: String, config: BuildConfig, timestamp: String) -> Self {
        BuildRun {
            id,
            config,
            timestamp,
            stage: BuildStage::Queued,
            submitted_at: Local::now(),
            started_at: None,
            ended_at: None,
            stages: Vec::new(),
            outcome: None,
            failed_stage: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    /// Advance into `stage` and open its stage-log entry.
    pub fn begin_stage(&mut self, stage: BuildStage) -> Result<(), String> {
        if !self.stage.can_transition_to(stage) || stage.is_terminal() {
            return Err(format!(
                "Invalid stage transition: {} -> {}",
                self.stage, stage
            ));
        }
        let now = Local::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.stage = stage;
        self.stages.push(StageRecord {
            name: stage,
            started_at: now,
            ended_at: None,
            status: StageStatus::Running,
            error: None,
            attempts: 1,
        });
        Ok(())
    }

    /// Count an extra attempt of the current stage.
    pub fn record_retry(&mut self) {
        if let Some(record) = self.current_record_mut() {
            record.attempts += 1;
        }
    }

    /// Close the current stage's entry as succeeded.
    pub fn complete_stage(&mut self) {
        if let Some(record) = self.current_record_mut() {
            record.status = StageStatus::Succeeded;
            record.ended_at = Some(Local::now());
        }
    }

    /// Move to `DONE` after VERIFY completed.
    pub fn finish(&mut self) -> Result<(), String> {
        if !self.stage.can_transition_to(BuildStage::Done) {
            return Err(format!(
                "Invalid stage transition: {} -> {}",
                self.stage,
                BuildStage::Done
            ));
        }
        self.stage = BuildStage::Done;
        self.outcome = Some(BuildOutcome::Success);
        self.ended_at = Some(Local::now());
        Ok(())
    }

    /// Move to `FAILED`, recording the stage that was executing.
    pub fn fail(&mut self, error: BuildError) {
        if self.stage.is_terminal() {
            return;
        }
        let now = Local::now();
        let status = match error {
            BuildError::StageTimeout { .. } => StageStatus::TimedOut,
            BuildError::Cancelled => StageStatus::Cancelled,
            _ => StageStatus::Failed,
        };
        if let Some(record) = self.current_record_mut() {
            record.status = status;
            record.ended_at = Some(now);
            record.error = Some(error.to_string());
        }
        self.failed_stage = Some(self.stage);
        self.stage = BuildStage::Failed;
        self.outcome = Some(BuildOutcome::Failed);
        self.error = Some(error);
        self.ended_at = Some(now);
    }

    /// Fail with `Cancelled` at `stage`, which was about to start. The stage is
    /// entered without running so the report names where the run stopped.
    pub fn cancel_before(&mut self, stage: BuildStage) {
        if let Err(e) = self.begin_stage(stage) {
            log::debug!("[State] {}: {}", self.id, e);
        }
        self.fail(BuildError::Cancelled);
    }

    /// Record a produced file. One artifact per kind: a promoted copy replaces
    /// its staged record.
    pub fn record_artifact(&mut self, artifact: Artifact) {
        match self.artifacts.iter_mut().find(|a| a.kind == artifact.kind) {
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Wall-clock duration from first stage to termination.
    pub fn duration_secs(&self) -> f64 {
        let start = self.started_at.unwrap_or(self.submitted_at);
        let end = self.ended_at.unwrap_or_else(Local::now);
        ((end - start).num_milliseconds().max(0)) as f64 / 1000.0
    }

    fn current_record_mut(&mut self) -> Option<&mut StageRecord> {
        let stage = self.stage;
        self.stages
            .last_mut()
            .filter(|r| r.name == stage && r.status == StageStatus::Running)
    }

    /// Read-only view for status queries.
    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.id.clone(),
            device: self.config.device().codename.clone(),
            flavor: self.config.flavor(),
            version: self.config.version().to_string(),
            fingerprint: self.config.fingerprint().to_string(),
            stage: self.stage,
            failed_stage: self.failed_stage,
            outcome: self.outcome,
            error: self.error.as_ref().map(|e| e.to_string()),
            error_kind: self.error.as_ref().map(|e| e.kind().to_string()),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            stages: self.stages.clone(),
            log_tail: Vec::new(),
        }
    }
}

/// Snapshot returned by status queries. Always well-formed, never blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub device: String,
    pub flavor: RecoveryFlavor,
    pub version: String,
    pub fingerprint: String,
    pub stage: BuildStage,
    pub failed_stage: Option<BuildStage>,
    pub outcome: Option<BuildOutcome>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub submitted_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub stages: Vec<StageRecord>,
    pub log_tail: Vec<String>,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}
