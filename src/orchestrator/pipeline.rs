//! Stage bodies and the sequential stage loop.
//!
//! `Pipeline::execute` drives one `BuildRun` from QUEUED to DONE or FAILED. Each
//! stage runs under its own deadline; every external call inside the stage is
//! given the same deadline so an overrunning tool is killed, not orphaned.
//! Filesystem-bound stages (DEVICE_DETECT, IMAGE_CREATE, PACKAGE, VERIFY) run on
//! the blocking pool so the deadline fires while they work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::artifacts::{self, ArchiveMetadata, ArtifactNames};
use crate::config::{BuildConfig, Settings};
use crate::devices::{roomservice, DeviceInfo};
use crate::error::BuildError;
use crate::log_collector::LogCollector;
use crate::models::{Artifact, ArtifactKind, BuildOption};
use crate::orchestrator::executor::{ToolInvocation, ToolStep, Toolchain};
use crate::orchestrator::state::{BuildRun, BuildStage};
use crate::workspace::{Workspace, WorkspaceDir};

/// Keyed mutual exclusion for shared source checkouts.
#[derive(Default)]
pub struct SyncLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkout lock SOURCE_SYNC needs, taken in hierarchy order
    /// (pair, flavor, tree).
    pub async fn acquire_checkouts(&self, config: &BuildConfig) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(3);
        for key in [
            Self::pair_key(config),
            Self::flavor_key(config),
            Self::tree_key(config.device()),
        ] {
            guards.push(self.acquire(&key).await);
        }
        guards
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Serializes syncs of one flavor/device pair.
    pub fn pair_key(config: &BuildConfig) -> String {
        format!("pair:{}:{}", config.flavor().as_str(), config.device().codename)
    }

    /// Serializes `repo` operations on `sources/<flavor>`.
    pub fn flavor_key(config: &BuildConfig) -> String {
        format!("flavor:{}", config.flavor().as_str())
    }

    /// Serializes git operations on one device tree checkout.
    pub fn tree_key(device: &DeviceInfo) -> String {
        format!("tree:{}:{}", if device.custom { "custom" } else { "builtin" }, device.codename)
    }
}

/// Everything a stage needs besides the run itself.
#[derive(Clone)]
pub struct Pipeline {
    pub workspace: Arc<Workspace>,
    pub settings: Arc<Settings>,
    pub toolchain: Arc<dyn Toolchain>,
    pub locks: Arc<SyncLocks>,
}

impl Pipeline {
    /// Run every stage in order. Returns with `run` terminal.
    ///
    /// `on_change` is called after each transition. Cancellation is observed
    /// between stages only.
    pub async fn execute(
        &self,
        run: &mut BuildRun,
        log: &LogCollector,
        cancel: &watch::Receiver<bool>,
        on_change: &(dyn Fn(&BuildRun) + Send + Sync),
    ) {
        log.log_parsed(format!(
            "Build {} started: {} {} for {} ({})",
            run.id,
            run.config.flavor(),
            run.config.version(),
            run.config.device().display_name,
            run.config.device().codename
        ));

        for stage in BuildStage::PIPELINE {
            if *cancel.borrow() {
                log.log_parsed(format!("Cancellation observed before {}", stage));
                log::warn!("[Pipeline] [{}] Run {} cancelled", stage, run.id);
                run.cancel_before(stage);
                on_change(run);
                return;
            }

            if let Err(e) = run.begin_stage(stage) {
                run.fail(BuildError::Resource(e));
                on_change(run);
                return;
            }
            on_change(run);
            log.log_parsed(format!("Stage {} started", stage));
            log::info!("[Pipeline] [{}] Run {} entering stage", stage, run.id);

            let result = self.run_bounded(stage, run, log).await;

            match result {
                Ok(produced) => {
                    for artifact in produced {
                        log.log_str(format!(
                            "Artifact {} ({} bytes, sha256 {})",
                            artifact.path.display(),
                            artifact.size,
                            artifact.sha256
                        ));
                        run.record_artifact(artifact);
                    }
                    run.complete_stage();
                    log.log_parsed(format!("Stage {} succeeded", stage));
                    on_change(run);
                }
                Err(e) => {
                    log.log_parsed(format!("Stage {} failed: {}", stage, e));
                    log::error!("[Pipeline] [{}] Run {} failed: {}", stage, run.id, e);
                    run.fail(e);
                    on_change(run);
                    return;
                }
            }
        }

        match run.finish() {
            Ok(()) => {
                log.log_parsed(format!(
                    "Build {} finished in {:.1}s",
                    run.id,
                    run.duration_secs()
                ));
                log::info!("[Pipeline] [DONE] Run {} succeeded", run.id);
            }
            Err(e) => run.fail(BuildError::Resource(e)),
        }
        on_change(run);
    }

    /// One stage under its deadline, with SOURCE_SYNC's optional retries.
    async fn run_bounded(
        &self,
        stage: BuildStage,
        run: &mut BuildRun,
        log: &LogCollector,
    ) -> Result<Vec<Artifact>, BuildError> {
        let timeout = self
            .settings
            .stage_timeout(stage)
            .unwrap_or_else(|| std::time::Duration::from_secs(24 * 60 * 60));

        // Waiting for another run's checkout is not charged to this stage.
        let _checkouts = if stage == BuildStage::SourceSync {
            log.log_str("Waiting for source checkout locks");
            self.locks.acquire_checkouts(&run.config).await
        } else {
            Vec::new()
        };

        let deadline = Instant::now() + timeout;
        let timed_out = BuildError::StageTimeout {
            stage,
            seconds: timeout.as_secs(),
        };

        let max_attempts = if stage == BuildStage::SourceSync {
            1 + self.settings.sync_retries
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            let outcome =
                tokio::time::timeout_at(deadline, self.run_stage(stage, run, log, deadline)).await;
            match outcome {
                Err(_) => return Err(timed_out),
                Ok(Err(BuildError::StageFailure { message, .. }))
                    if attempt < max_attempts && Instant::now() < deadline =>
                {
                    log.log_parsed(format!(
                        "Stage {} attempt {}/{} failed, retrying: {}",
                        stage, attempt, max_attempts, message
                    ));
                    log::warn!(
                        "[Pipeline] [{}] Retrying run {} (attempt {} of {})",
                        stage,
                        run.id,
                        attempt + 1,
                        max_attempts
                    );
                    run.record_retry();
                    attempt += 1;
                }
                Ok(result) => return result,
            }
        }
    }

    async fn run_stage(
        &self,
        stage: BuildStage,
        run: &BuildRun,
        log: &LogCollector,
        deadline: Instant,
    ) -> Result<Vec<Artifact>, BuildError> {
        match stage {
            BuildStage::EnvSetup => self.env_setup(run, log, deadline).await.map(|_| Vec::new()),
            BuildStage::SourceSync => self.source_sync(run, log, deadline).await.map(|_| Vec::new()),
            BuildStage::DeviceDetect => {
                self.run_blocking(stage, run, log, |p, run, log| {
                    p.device_detect(run, log).map(|_| Vec::new())
                })
                .await
            }
            BuildStage::Compile => self.compile(run, log, deadline).await.map(|_| Vec::new()),
            BuildStage::ImageCreate => {
                self.run_blocking(stage, run, log, |p, run, _| p.image_create(run).map(|a| vec![a]))
                    .await
            }
            BuildStage::Package => {
                self.run_blocking(stage, run, log, |p, run, _| p.package(run).map(|a| vec![a]))
                    .await
            }
            BuildStage::Verify => {
                let deadline = deadline.into_std();
                self.run_blocking(stage, run, log, move |p, run, log| {
                    p.verify(run, log, deadline)
                })
                .await
            }
            BuildStage::Queued | BuildStage::Done | BuildStage::Failed => Err(BuildError::Resource(
                format!("{} is not an executable stage", stage),
            )),
        }
    }

    /// Run a stage body on the blocking pool against a snapshot of the run.
    async fn run_blocking<F>(
        &self,
        stage: BuildStage,
        run: &BuildRun,
        log: &LogCollector,
        body: F,
    ) -> Result<Vec<Artifact>, BuildError>
    where
        F: FnOnce(&Pipeline, &BuildRun, &LogCollector) -> Result<Vec<Artifact>, BuildError>
            + Send
            + 'static,
    {
        let pipeline = self.clone();
        let snapshot = run.clone();
        let log = log.clone();
        tokio::task::spawn_blocking(move || body(&pipeline, &snapshot, &log))
            .await
            .map_err(|e| BuildError::Resource(format!("{} worker stopped: {}", stage, e)))?
    }

    async fn invoke(
        &self,
        stage: BuildStage,
        invocation: ToolInvocation,
        log: &LogCollector,
        deadline: Instant,
    ) -> Result<(), BuildError> {
        log.log_str(format!("$ {}", invocation.command_line()));
        let seconds = self
            .settings
            .stage_timeout(stage)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.toolchain
            .run(&invocation, deadline, log)
            .await
            .into_result(stage, seconds)
    }

    fn flavor_source_dir(&self, config: &BuildConfig) -> Result<PathBuf, BuildError> {
        Ok(self
            .workspace
            .ensure(WorkspaceDir::flavor_sources(config.flavor()))?)
    }

    fn staging_dir(&self, run: &BuildRun) -> Result<PathBuf, BuildError> {
        Ok(self
            .workspace
            .run_staging_dir(run.config.device(), run.config.flavor(), &run.id)?)
    }

    fn out_dir(&self, run: &BuildRun) -> Result<PathBuf, BuildError> {
        Ok(self
            .workspace
            .run_build_dir(run.config.device(), run.config.flavor(), &run.id)?
            .join("out"))
    }

    // ENV_SETUP ---------------------------------------------------------------

    async fn env_setup(
        &self,
        run: &BuildRun,
        log: &LogCollector,
        deadline: Instant,
    ) -> Result<(), BuildError> {
        let stage = BuildStage::EnvSetup;

        let mut missing = Vec::new();
        for tool in &self.settings.required_tools {
            if self.toolchain.tool_available(tool).await {
                log.log_str(format!("Found required tool: {}", tool));
            } else {
                missing.push(tool.clone());
            }
        }
        if run.config.has_option(BuildOption::Ccache) && !self.toolchain.tool_available("ccache").await {
            missing.push("ccache".to_string());
        }
        if !missing.is_empty() {
            return Err(BuildError::StageFailure {
                stage,
                message: format!("missing required tools: {}", missing.join(", ")),
            });
        }

        let ccache_dir = self.workspace.ccache_dir()?;
        let script = self.workspace.build_env_script()?;
        if write_if_changed(&script, &build_env_script(&ccache_dir))? {
            log.log_str(format!("Wrote {}", script.display()));
        } else {
            log.log_str(format!("{} is up to date", script.display()));
        }

        self.flavor_source_dir(&run.config)?;
        self.workspace
            .run_build_dir(run.config.device(), run.config.flavor(), &run.id)?;

        let probe = ToolInvocation::new(ToolStep::ProbeTool, "bash", self.workspace.root())
            .arg("-c")
            .arg(format!("source \"{}\"", script.display()));
        self.invoke(stage, probe, log, deadline).await
    }

    // SOURCE_SYNC -------------------------------------------------------------

    /// Caller holds the checkout locks.
    async fn source_sync(
        &self,
        run: &BuildRun,
        log: &LogCollector,
        deadline: Instant,
    ) -> Result<(), BuildError> {
        let stage = BuildStage::SourceSync;
        let config = &run.config;
        let device = config.device();

        let manifest = self.workspace.roomservice_file(&device.codename)?;
        let xml = roomservice::render(device, config.flavor(), config.version());
        write_if_changed(&manifest, &xml)?;
        log.log_str(format!("Roomservice manifest: {}", manifest.display()));

        let source_dir = self.flavor_source_dir(config)?;
        if source_dir.join(".repo").is_dir() {
            log.log_str(format!(
                "Reusing existing {} checkout at {}",
                config.flavor(),
                source_dir.display()
            ));
        } else {
            let init = ToolInvocation::new(ToolStep::ManifestInit, "repo", &source_dir).args([
                "init".to_string(),
                "--depth=1".to_string(),
                "-u".to_string(),
                config.flavor().manifest_url().to_string(),
                "-b".to_string(),
                config.manifest_branch(),
            ]);
            self.invoke(stage, init, log, deadline).await?;
        }

        let local_manifests = source_dir.join(".repo").join("local_manifests");
        std::fs::create_dir_all(&local_manifests)?;
        write_if_changed(
            &local_manifests.join(format!("roomservice_{}.xml", device.codename)),
            &xml,
        )?;

        let sync = ToolInvocation::new(ToolStep::ManifestSync, "repo", &source_dir).args([
            "sync".to_string(),
            "-c".to_string(),
            "--force-sync".to_string(),
            "--no-clone-bundle".to_string(),
            "--no-tags".to_string(),
            format!("-j{}", self.settings.jobs),
        ]);
        self.invoke(stage, sync, log, deadline).await?;

        let tree_dir = self.workspace.device_tree_dir(device)?;
        let branch = device
            .tree
            .branch
            .clone()
            .unwrap_or_else(|| config.manifest_branch());

        if tree_dir.join(".git").is_dir() {
            let update = ToolInvocation::new(ToolStep::TreeUpdate, "git", &tree_dir).args([
                "-C".to_string(),
                tree_dir.display().to_string(),
                "pull".to_string(),
                "--ff-only".to_string(),
            ]);
            self.invoke(stage, update, log, deadline).await
        } else {
            if tree_dir.exists() {
                log.log_str(format!(
                    "Removing incomplete device tree at {}",
                    tree_dir.display()
                ));
                std::fs::remove_dir_all(&tree_dir)?;
            }
            let parent = tree_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.workspace.root().to_path_buf());
            let clone = ToolInvocation::new(ToolStep::TreeClone, "git", parent).args([
                "clone".to_string(),
                "--depth=1".to_string(),
                "-b".to_string(),
                branch,
                device.tree.url.clone(),
                tree_dir.display().to_string(),
            ]);
            self.invoke(stage, clone, log, deadline).await
        }
    }

    // DEVICE_DETECT -----------------------------------------------------------

    fn device_detect(&self, run: &BuildRun, log: &LogCollector) -> Result<(), BuildError> {
        let device = run.config.device();
        let tree_dir = self.workspace.device_tree_dir(device)?;

        let board_config = tree_dir.join("BoardConfig.mk");
        let content = std::fs::read_to_string(&board_config).map_err(|_| {
            BuildError::Compatibility(format!(
                "{} has no BoardConfig.mk in {}",
                device.codename,
                tree_dir.display()
            ))
        })?;

        if let Some(arch) = board_value(&content, "TARGET_ARCH") {
            if arch != device.arch {
                return Err(BuildError::Compatibility(format!(
                    "device tree targets {} but {} is registered as {}",
                    arch, device.codename, device.arch
                )));
            }
        }

        if !tree_dir.join("AndroidProducts.mk").exists() {
            log.log_str(format!(
                "Warning: {} has no AndroidProducts.mk; relying on vendorsetup",
                tree_dir.display()
            ));
        }
        log.log_str(format!(
            "Device tree for {} validated for {}",
            device.codename,
            run.config.flavor()
        ));
        Ok(())
    }

    // COMPILE -----------------------------------------------------------------

    async fn compile(
        &self,
        run: &BuildRun,
        log: &LogCollector,
        deadline: Instant,
    ) -> Result<(), BuildError> {
        let config = &run.config;
        let source_dir = self.flavor_source_dir(config)?;
        let out_dir = self.out_dir(run)?;

        if config.has_option(BuildOption::CleanBuild) && out_dir.exists() {
            log.log_str(format!("clean_build: removing {}", out_dir.display()));
            std::fs::remove_dir_all(&out_dir)?;
        }
        std::fs::create_dir_all(&out_dir)?;

        let mut env = config.environment();
        env.push(("OUT_DIR".to_string(), out_dir.display().to_string()));
        if config.has_option(BuildOption::Ccache) {
            env.push((
                "CCACHE_DIR".to_string(),
                self.workspace.ccache_dir()?.display().to_string(),
            ));
        }

        let script = self.workspace.build_env_script()?;
        let command = format!(
            "source \"{}\" && source build/envsetup.sh && lunch {} && mka recoveryimage -j{}",
            script.display(),
            config.lunch_target(),
            self.settings.jobs
        );
        let compile = ToolInvocation::new(ToolStep::Compile, "bash", source_dir)
            .args(["-c".to_string(), command])
            .envs(env);
        self.invoke(BuildStage::Compile, compile, log, deadline).await
    }

    // IMAGE_CREATE ------------------------------------------------------------

    fn image_create(&self, run: &BuildRun) -> Result<Artifact, BuildError> {
        let device = run.config.device();
        let built = self
            .out_dir(run)?
            .join("target")
            .join("product")
            .join(&device.codename)
            .join("recovery.img");
        if !built.is_file() {
            return Err(BuildError::StageFailure {
                stage: BuildStage::ImageCreate,
                message: format!("recovery image not found at {}", built.display()),
            });
        }

        let names = ArtifactNames::new(run.config.flavor(), &device.codename, &run.timestamp);
        let dest = self.staging_dir(run)?.join(&names.image);
        artifacts::install_file(&built, &dest)?;
        Ok(artifacts::describe(&dest, ArtifactKind::Image, &run.id)?)
    }

    // PACKAGE -----------------------------------------------------------------

    fn package(&self, run: &BuildRun) -> Result<Artifact, BuildError> {
        let image = run
            .artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Image)
            .ok_or_else(|| BuildError::StageFailure {
                stage: BuildStage::Package,
                message: "no recovery image recorded".to_string(),
            })?;

        let device = run.config.device();
        let names = ArtifactNames::new(run.config.flavor(), &device.codename, &run.timestamp);
        let dest = self.staging_dir(run)?.join(&names.archive);
        let metadata = ArchiveMetadata {
            run_id: run.id.clone(),
            device: device.codename.clone(),
            flavor: run.config.flavor(),
            version: run.config.version().to_string(),
            timestamp: run.timestamp.clone(),
            image: image.file_name(),
            image_sha256: image.sha256.clone(),
        };
        artifacts::package_archive(&image.path, &dest, &metadata)?;
        Ok(artifacts::describe(&dest, ArtifactKind::Archive, &run.id)?)
    }

    // VERIFY ------------------------------------------------------------------

    /// Re-checksum the staged image and archive, then promote both into
    /// `artifacts/`. Either both are promoted or neither is.
    fn verify(
        &self,
        run: &BuildRun,
        log: &LogCollector,
        deadline: std::time::Instant,
    ) -> Result<Vec<Artifact>, BuildError> {
        let stage = BuildStage::Verify;
        let failure = |message: String| BuildError::StageFailure { stage, message };

        let mut staged = Vec::new();
        for kind in [ArtifactKind::Image, ArtifactKind::Archive] {
            let artifact = run
                .artifacts
                .iter()
                .find(|a| a.kind == kind)
                .ok_or_else(|| failure(format!("expected {:?} artifact was not produced", kind)))?;
            artifacts::verify(artifact).map_err(|e| failure(e.to_string()))?;
            log.log_str(format!(
                "Verified {} sha256={}",
                artifact.file_name(),
                artifact.sha256
            ));
            staged.push(artifact);
        }

        let mut targets = Vec::with_capacity(staged.len());
        for artifact in &staged {
            let dest = self.workspace.artifact_path(&artifact.file_name())?;
            if dest.exists() {
                return Err(failure(format!("{} already exists", dest.display())));
            }
            targets.push(dest);
        }

        // The stage may already have been abandoned by its deadline.
        if std::time::Instant::now() >= deadline {
            return Err(failure("deadline passed before promotion".to_string()));
        }

        let mut promoted: Vec<Artifact> = Vec::with_capacity(staged.len());
        for (artifact, dest) in staged.iter().zip(&targets) {
            if let Err(e) = artifacts::promote(&artifact.path, dest) {
                for (done, original) in promoted.iter().zip(&staged) {
                    let _ = std::fs::rename(&done.path, &original.path);
                }
                return Err(failure(e.to_string()));
            }
            log.log_str(format!("Promoted {}", dest.display()));
            promoted.push(Artifact {
                path: dest.clone(),
                ..Artifact::clone(artifact)
            });
        }
        Ok(promoted)
    }
}

/// `KEY := value` (or `=`, `?=`) lookup in a makefile fragment.
fn board_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix(key)?;
        let rest = rest.trim_start();
        let value = rest
            .strip_prefix(":=")
            .or_else(|| rest.strip_prefix("?="))
            .or_else(|| rest.strip_prefix('='))?;
        Some(value.trim().to_string())
    })
}

fn build_env_script(ccache_dir: &Path) -> String {
    format!(
        "#!/usr/bin/env bash\n\
         # Android build environment for recovery_builder.\n\
         export ALLOW_MISSING_DEPENDENCIES=true\n\
         export LC_ALL=C\n\
         export USE_CCACHE=\"${{USE_CCACHE:-0}}\"\n\
         export CCACHE_DIR=\"${{CCACHE_DIR:-{}}}\"\n\
         export CCACHE_MAXSIZE=\"${{CCACHE_MAXSIZE:-50G}}\"\n",
        ccache_dir.display()
    )
}

/// Write `contents` unless the file already holds exactly that. Returns whether
/// anything was written.
fn write_if_changed(path: &Path, contents: &str) -> Result<bool, BuildError> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == contents {
            return Ok(false);
        }
    }
    artifacts::write_atomic(path, contents.as_bytes())?;
    if path.extension().map_or(false, |ext| ext == "sh") {
        make_executable(path)?;
    }
    Ok(true)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_board_value() {
        let content = "LOCAL_PATH := device/google/redfin\nTARGET_ARCH := arm64\nTARGET_ARCH_VARIANT ?= armv8-a\n";
        assert_eq!(board_value(content, "TARGET_ARCH"), Some("arm64".to_string()));
        assert_eq!(
            board_value(content, "TARGET_ARCH_VARIANT"),
            Some("armv8-a".to_string())
        );
        assert_eq!(board_value(content, "TARGET_CPU_ABI"), None);
    }

    #[test]
    fn test_write_if_changed_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tools/build_env.sh");
        let script = build_env_script(&temp.path().join("cache/ccache"));

        assert!(write_if_changed(&path, &script).unwrap());
        assert!(!write_if_changed(&path, &script).unwrap());
        assert!(write_if_changed(&path, "#!/bin/sh\n").unwrap());
    }

    #[tokio::test]
    async fn test_sync_locks_serialize_same_key() {
        let locks = Arc::new(SyncLocks::new());
        let guard = locks.acquire("flavor:twrp").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("flavor:twrp").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A different key is independent.
        let _unrelated = locks.acquire("flavor:orange_fox").await;

        drop(guard);
        waiter.await.unwrap();
    }
}
