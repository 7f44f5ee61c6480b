//! Artifact & Report Manager.
//!
//! Names, checksums and installs everything a run produces under `artifacts/`:
//!
//! - `{flavor}_{device}_{timestamp}.img`: recovery image
//! - `{flavor}_{device}_{timestamp}.zip`: flashable archive (image + `build_info.json`)
//! - `{flavor}_{device}_{timestamp}_build.log`: copy of the run log
//! - `build_report_{timestamp}.json`: the `BuildReport`
//!
//! Files are written to a temporary sibling and renamed into place, so a name in
//! `artifacts/` always refers to a complete file. Images and archives are built
//! in the run's staging directory and only promoted once VERIFY passes.

pub mod report;
pub mod stats;

pub use report::{BuildReport, StageEntry};
pub use stats::{DeviceStats, Statistics, StatisticsStore};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ArtifactError;
use crate::log_collector::LogCollector;
use crate::models::{Artifact, ArtifactKind, RecoveryFlavor};
use crate::orchestrator::state::BuildRun;
use crate::workspace::{Workspace, WorkspaceDir};

/// Deterministic artifact file names for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub image: String,
    pub archive: String,
    pub log: String,
    pub report: String,
}

impl ArtifactNames {
    pub fn new(flavor: RecoveryFlavor, device: &str, timestamp: &str) -> Self {
        let stem = format!("{}_{}_{}", flavor.as_str(), device, timestamp);
        ArtifactNames {
            image: format!("{}.img", stem),
            archive: format!("{}.zip", stem),
            log: format!("{}_build.log", stem),
            report: report_file_name(timestamp),
        }
    }
}

pub fn report_file_name(timestamp: &str) -> String {
    format!("build_report_{}.json", timestamp)
}

/// Metadata stored inside the flashable archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub run_id: String,
    pub device: String,
    pub flavor: RecoveryFlavor,
    pub version: String,
    pub timestamp: String,
    pub image: String,
    pub image_sha256: String,
}

/// Name of the metadata entry inside archives.
pub const ARCHIVE_METADATA_NAME: &str = "build_info.json";

/// Hex sha256 of a file, read in chunks.
pub fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Checksum an on-disk file into an `Artifact` record.
///
/// Missing and empty files are rejected: an artifact is only recorded once its
/// content exists.
pub fn describe(path: &Path, kind: ArtifactKind, run_id: &str) -> Result<Artifact, ArtifactError> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| ArtifactError::Missing(path.display().to_string()))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(ArtifactError::Missing(format!(
            "{} is empty or not a regular file",
            path.display()
        )));
    }
    Ok(Artifact {
        path: path.to_path_buf(),
        kind,
        size: metadata.len(),
        sha256: sha256_file(path)?,
        build_run_id: run_id.to_string(),
    })
}

/// Re-checksum a recorded artifact and compare.
pub fn verify(artifact: &Artifact) -> Result<(), ArtifactError> {
    let current = describe(&artifact.path, artifact.kind, &artifact.build_run_id)?;
    if current.sha256 != artifact.sha256 || current.size != artifact.size {
        return Err(ArtifactError::Archive(format!(
            "{} changed after it was recorded",
            artifact.path.display()
        )));
    }
    Ok(())
}

fn staging_file(dest: &Path) -> Result<(tempfile::NamedTempFile, PathBuf), ArtifactError> {
    let parent = dest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&parent)?;
    Ok((tempfile::NamedTempFile::new_in(&parent)?, parent))
}

/// Copy `src` to `dest` through a temporary sibling.
pub fn install_file(src: &Path, dest: &Path) -> Result<(), ArtifactError> {
    if !src.is_file() {
        return Err(ArtifactError::Missing(src.display().to_string()));
    }
    let (mut tmp, _) = staging_file(dest)?;
    let mut input = File::open(src)?;
    std::io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(dest)?;
    Ok(())
}

/// Write `contents` to `dest` through a temporary sibling.
pub fn write_atomic(dest: &Path, contents: &[u8]) -> Result<(), ArtifactError> {
    let (mut tmp, _) = staging_file(dest)?;
    tmp.write_all(contents)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(dest)?;
    Ok(())
}

/// Move a staged file to its final name. Never replaces an existing file;
/// falls back to copying when `staged` is on another filesystem.
pub fn promote(staged: &Path, dest: &Path) -> Result<(), ArtifactError> {
    if !staged.is_file() {
        return Err(ArtifactError::Missing(staged.display().to_string()));
    }
    if dest.exists() {
        return Err(ArtifactError::Exists(dest.display().to_string()));
    }
    if std::fs::rename(staged, dest).is_err() {
        install_file(staged, dest)?;
        std::fs::remove_file(staged)?;
    }
    Ok(())
}

/// Build the flashable archive: the image plus `build_info.json`.
pub fn package_archive(
    image: &Path,
    dest: &Path,
    metadata: &ArchiveMetadata,
) -> Result<(), ArtifactError> {
    if !image.is_file() {
        return Err(ArtifactError::Missing(image.display().to_string()));
    }
    let (tmp, _) = staging_file(dest)?;
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut writer = zip::ZipWriter::new(tmp.reopen()?);
    writer.start_file(metadata.image.as_str(), options)?;
    let mut input = File::open(image)?;
    std::io::copy(&mut input, &mut writer)?;

    writer.start_file(ARCHIVE_METADATA_NAME, options)?;
    writer.write_all(serde_json::to_string_pretty(metadata)?.as_bytes())?;
    let file = writer.finish()?;
    file.sync_all()?;

    tmp.persist(dest)?;
    Ok(())
}

/// Optional narrowing for `ArtifactManager::list_artifacts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactFilter {
    pub device: Option<String>,
    pub flavor: Option<RecoveryFlavor>,
}

impl ArtifactFilter {
    fn matches(&self, report: &BuildReport) -> bool {
        self.device.as_deref().map_or(true, |d| d == report.device)
            && self.flavor.map_or(true, |f| f == report.flavor)
    }
}

/// Owner of the artifact directory, the report set and the statistics.
pub struct ArtifactManager {
    workspace: Arc<Workspace>,
    stats: StatisticsStore,
}

impl ArtifactManager {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        let stats = StatisticsStore::load(workspace.statistics_file());
        ArtifactManager { workspace, stats }
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    /// Close out a terminated run: install the build log, write the report and
    /// fold the outcome into the statistics.
    ///
    /// Runs for failed builds too. Statistics are updated even when the report
    /// cannot be written; the first error is returned.
    pub async fn finalize(
        &self,
        run: &mut BuildRun,
        log: &LogCollector,
    ) -> Result<BuildReport, ArtifactError> {
        let device = run.config.device().codename.clone();
        let names = ArtifactNames::new(run.config.flavor(), &device, &run.timestamp);

        log.log_parsed(format!(
            "Finalizing {}: outcome {}",
            run.id,
            run.outcome.map(|o| o.to_string()).unwrap_or_else(|| "unknown".into())
        ));
        if let Err(e) = log.wait_for_empty().await {
            log::warn!("[Artifacts] Log flush for {} failed: {}", run.id, e);
        }

        let log_dest = self.workspace.artifact_path(&names.log)?;
        match install_file(log.path(), &log_dest)
            .and_then(|_| describe(&log_dest, ArtifactKind::Log, &run.id))
        {
            Ok(artifact) => run.record_artifact(artifact),
            Err(e) => log::warn!("[Artifacts] Could not install build log for {}: {}", run.id, e),
        }

        let report = BuildReport::from_run(run);
        let written = report.write(&self.workspace.ensure(WorkspaceDir::Artifacts)?);
        let recorded = self
            .stats
            .record(&device, report.is_success(), report.duration_secs);

        let path = written?;
        recorded?;
        log::info!(
            "[Artifacts] Report for {} written to {}",
            run.id,
            path.display()
        );
        Ok(report)
    }

    /// Reports of completed runs, newest first.
    pub fn history(&self) -> Result<Vec<BuildReport>, ArtifactError> {
        BuildReport::load_all(&self.workspace.path(WorkspaceDir::Artifacts))
    }

    /// Every artifact recorded by a report, plus the report files themselves.
    /// Files deleted since are left out.
    pub fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>, ArtifactError> {
        let artifacts_dir = self.workspace.path(WorkspaceDir::Artifacts);
        let mut listed = Vec::new();
        for report in self.history()?.iter().filter(|r| filter.matches(r)) {
            listed.extend(report.artifacts.iter().filter(|a| a.path.is_file()).cloned());
            let report_path = artifacts_dir.join(report.file_name());
            if let Ok(artifact) = describe(&report_path, ArtifactKind::Report, &report.run_id) {
                listed.push(artifact);
            }
        }
        Ok(listed)
    }
}
