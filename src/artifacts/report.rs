//! Machine-readable build reports (`build_report_{timestamp}.json`).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;
use crate::models::{Artifact, BuildOption, BuildOutcome, RecoveryFlavor, StageStatus};
use crate::orchestrator::state::{BuildRun, BuildStage};

/// Per-stage timing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub name: BuildStage,
    pub started_at: DateTime<Local>,
    pub ended_at: Option<DateTime<Local>>,
    pub status: StageStatus,
    pub duration_secs: Option<f64>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one terminated BuildRun. Written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub run_id: String,
    pub device: String,
    pub flavor: RecoveryFlavor,
    pub version: String,
    pub options: Vec<BuildOption>,
    pub fingerprint: String,
    pub timestamp: String,
    pub outcome: BuildOutcome,
    pub failed_stage: Option<BuildStage>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration_secs: f64,
    pub stages: Vec<StageEntry>,
    pub artifacts: Vec<Artifact>,
}

impl BuildReport {
    /// Snapshot a terminated run.
    pub fn from_run(run: &BuildRun) -> Self {
        let now = Local::now();
        BuildReport {
            run_id: run.id.clone(),
            device: run.config.device().codename.clone(),
            flavor: run.config.flavor(),
            version: run.config.version().to_string(),
            options: run.config.options().iter().copied().collect(),
            fingerprint: run.config.fingerprint().to_string(),
            timestamp: run.timestamp.clone(),
            outcome: run.outcome.unwrap_or(BuildOutcome::Failed),
            failed_stage: run.failed_stage,
            error_kind: run.error.as_ref().map(|e| e.kind().to_string()),
            error: run.error.as_ref().map(|e| e.to_string()),
            started_at: run.started_at.unwrap_or(run.submitted_at),
            ended_at: run.ended_at.unwrap_or(now),
            duration_secs: run.duration_secs(),
            stages: run
                .stages
                .iter()
                .map(|s| StageEntry {
                    name: s.name,
                    started_at: s.started_at,
                    ended_at: s.ended_at,
                    status: s.status,
                    duration_secs: s.duration_secs(),
                    attempts: s.attempts,
                    error: s.error.clone(),
                })
                .collect(),
            artifacts: run.artifacts.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == BuildOutcome::Success
    }

    pub fn file_name(&self) -> String {
        super::report_file_name(&self.timestamp)
    }

    /// Write the report into `artifacts_dir`. An existing report with the same
    /// name is never overwritten.
    pub fn write(&self, artifacts_dir: &Path) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(artifacts_dir)?;
        let dest = artifacts_dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self)?;

        let mut tmp = tempfile::NamedTempFile::new_in(artifacts_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist_noclobber(&dest)?;
        Ok(dest)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All reports in `artifacts_dir`, newest first. Unreadable reports are
    /// logged and skipped.
    pub fn load_all(artifacts_dir: &Path) -> Result<Vec<Self>, ArtifactError> {
        if !artifacts_dir.exists() {
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for entry in std::fs::read_dir(artifacts_dir)? {
            let path = entry?.path();
            let is_report = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("build_report_") && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_report {
                continue;
            }
            match Self::load(&path) {
                Ok(report) => reports.push(report),
                Err(e) => log::warn!(
                    "[Artifacts] Skipping unreadable report {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        reports.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(reports)
    }
}
