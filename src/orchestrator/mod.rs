//! Build Orchestration: admission, scheduling and tracking of BuildRuns.
//!
//! Stages run in a fixed order (QUEUED -> ENV_SETUP -> SOURCE_SYNC -> DEVICE_DETECT
//! -> COMPILE -> IMAGE_CREATE -> PACKAGE -> VERIFY -> DONE), with FAILED reachable
//! from any non-terminal stage. Each run is one tokio task gated by a semaphore
//! sized by `Settings::max_concurrent_builds`.
//!
//! # Module Structure
//!
//! - `state`: stage machine, `BuildRun`, `RunStatus`
//! - `executor`: the `Toolchain` seam over external tools
//! - `pipeline`: stage bodies and shared-checkout locking

pub mod executor;
pub mod pipeline;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};

pub use executor::{ProcessToolchain, ToolInvocation, ToolOutcome, ToolStep, Toolchain};
pub use pipeline::{Pipeline, SyncLocks};
pub use state::{BuildRun, BuildStage, RunStatus, StageRecord};

use crate::artifacts::{ArtifactFilter, ArtifactManager, BuildReport, Statistics};
use crate::config::{self, BuildConfig, Settings};
use crate::devices::{DeviceInfo, DeviceRegistry, DeviceSummary};
use crate::error::{BuildError, OrchestratorError, SubmitError, ValidationError};
use crate::log_collector::{LogCollector, TailReader};
use crate::models::{Artifact, ArtifactKind, BuildOutcome, RecoveryFlavor};
use crate::workspace::{format_timestamp, Workspace};

const EVENT_CAPACITY: usize = 1024;

/// Progress notifications for subscribers. Delivery is best effort: a slow
/// subscriber loses events, never blocks a build.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    Queued {
        run_id: String,
        device: String,
        flavor: RecoveryFlavor,
    },
    StageChanged {
        run_id: String,
        stage: BuildStage,
    },
    Log {
        run_id: String,
        line: String,
    },
    Finished {
        run_id: String,
        outcome: BuildOutcome,
        failed_stage: Option<BuildStage>,
    },
}

impl BuildEvent {
    pub fn run_id(&self) -> &str {
        match self {
            BuildEvent::Queued { run_id, .. }
            | BuildEvent::StageChanged { run_id, .. }
            | BuildEvent::Log { run_id, .. }
            | BuildEvent::Finished { run_id, .. } => run_id,
        }
    }
}

/// Returned by `submit`. The run id is the key for every later query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildHandle {
    pub run_id: String,
    pub fingerprint: String,
    pub timestamp: String,
}

struct RunEntry {
    status: watch::Receiver<RunStatus>,
    cancel: watch::Sender<bool>,
    report: watch::Receiver<Option<BuildReport>>,
    tail: TailReader,
}

struct Inner {
    settings: Arc<Settings>,
    workspace: Arc<Workspace>,
    registry: DeviceRegistry,
    artifacts: ArtifactManager,
    pipeline: Pipeline,
    admission: Arc<Semaphore>,
    runs: RwLock<HashMap<String, RunEntry>>,
    /// fingerprint -> run id of every non-terminal run
    active: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<BuildEvent>,
}

/// Entry point for submitting and observing builds. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator over `settings.workspace_root`.
    ///
    /// Creates the workspace layout and loads custom devices persisted by earlier
    /// sessions.
    ///
    /// # Arguments
    /// * `settings` - Validated orchestrator settings
    /// * `toolchain` - Runner for external tools (`ProcessToolchain` in production)
    pub fn new(settings: Settings, toolchain: Arc<dyn Toolchain>) -> Result<Self, OrchestratorError> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let workspace = Arc::new(Workspace::new(settings.workspace_root.clone())?);
        workspace.init_layout()?;

        let registry = DeviceRegistry::load(workspace.custom_devices_file());
        let artifacts = ArtifactManager::new(Arc::clone(&workspace));
        let pipeline = Pipeline {
            workspace: Arc::clone(&workspace),
            settings: Arc::clone(&settings),
            toolchain,
            locks: Arc::new(SyncLocks::new()),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        log::info!(
            "[Orchestrator] Workspace {} ready ({} devices, {} concurrent builds)",
            workspace.root().display(),
            registry.current().len(),
            settings.max_concurrent_builds
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                admission: Arc::new(Semaphore::new(settings.max_concurrent_builds)),
                settings,
                workspace,
                registry,
                artifacts,
                pipeline,
                runs: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.inner.workspace
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Validate a build request and enqueue it.
    ///
    /// Option keys are checked before anything else. A request whose fingerprint
    /// matches a non-terminal run is rejected with `DuplicateRun`.
    pub async fn submit(
        &self,
        device: &str,
        flavor: &str,
        version: &str,
        options: &HashMap<String, bool>,
    ) -> Result<BuildHandle, SubmitError> {
        config::parse_options(options)?;
        let flavor: RecoveryFlavor = flavor.parse()?;
        let device = self.inner.registry.lookup(device.trim())?;
        let config = BuildConfig::new(device, flavor, version, options)?;

        let (run_id, timestamp) = {
            let mut active = self.inner.active.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = active.get(config.fingerprint()) {
                return Err(SubmitError::DuplicateRun {
                    fingerprint: config.fingerprint().to_string(),
                    run_id: existing.clone(),
                });
            }
            let timestamp = format_timestamp(&self.inner.workspace.allocate_timestamp());
            let run_id = format!(
                "{}_{}_{}_{}",
                flavor.as_str(),
                config.device().codename,
                timestamp,
                config.short_fingerprint()
            );
            active.insert(config.fingerprint().to_string(), run_id.clone());
            (run_id, timestamp)
        };

        let log = match self.open_run_log(&run_id) {
            Ok(log) => log,
            Err(e) => {
                self.release(config.fingerprint());
                return Err(SubmitError::Resource(e));
            }
        };

        let handle = BuildHandle {
            run_id: run_id.clone(),
            fingerprint: config.fingerprint().to_string(),
            timestamp: timestamp.clone(),
        };

        let run = BuildRun::new(run_id.clone(), config, timestamp);
        let (status_tx, status_rx) = watch::channel(run.status());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (report_tx, report_rx) = watch::channel(None);

        {
            let mut runs = self.inner.runs.write().unwrap_or_else(|p| p.into_inner());
            runs.insert(
                run_id.clone(),
                RunEntry {
                    status: status_rx,
                    cancel: cancel_tx,
                    report: report_rx,
                    tail: log.tail_reader(),
                },
            );
        }

        log.log_parsed(format!(
            "Queued {} {} for {}",
            run.config.flavor(),
            run.config.version(),
            run.config.device().codename
        ));
        log::info!("[Orchestrator] [QUEUED] {}", run_id);
        let _ = self.inner.events.send(BuildEvent::Queued {
            run_id: run_id.clone(),
            device: run.config.device().codename.clone(),
            flavor,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(run, log, cancel_rx, status_tx, report_tx).await;
        });

        Ok(handle)
    }

    fn open_run_log(&self, run_id: &str) -> Result<LogCollector, String> {
        let path = self
            .inner
            .workspace
            .run_log_file(run_id)
            .map_err(|e| format!("logs directory: {}", e))?;
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let log = LogCollector::open(&path, self.inner.settings.log_tail_lines)
            .map_err(|e| format!("{}: {}", path.display(), e))?
            .with_listener(line_tx);

        let events = self.inner.events.clone();
        let id = run_id.to_string();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let _ = events.send(BuildEvent::Log {
                    run_id: id.clone(),
                    line: line.render(),
                });
            }
        });
        Ok(log)
    }

    fn release(&self, fingerprint: &str) {
        self.inner.release(fingerprint);
    }

    /// Current status of a run, including the tail of its log.
    ///
    /// Terminated runs, including those of earlier sessions, are answered from
    /// their build report.
    pub fn status(&self, run_id: &str) -> Result<RunStatus, OrchestratorError> {
        {
            let runs = self.inner.runs.read().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = runs.get(run_id) {
                let mut status = entry.status.borrow().clone();
                status.log_tail = entry.tail.tail(self.inner.settings.log_tail_lines);
                return Ok(status);
            }
        }
        let report = self.find_report(run_id)?;
        let mut status = status_from_report(&report);
        status.log_tail = self.logged_tail(&report);
        Ok(status)
    }

    /// Last lines of a finished run's log, from its log artifact or the run log.
    fn logged_tail(&self, report: &BuildReport) -> Vec<String> {
        let path = report
            .artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Log)
            .map(|a| a.path.clone())
            .or_else(|| self.inner.workspace.run_log_file(&report.run_id).ok());
        let Some(content) = path.and_then(|p| std::fs::read_to_string(p).ok()) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(self.inner.settings.log_tail_lines);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }

    /// Statuses of every run of this process that has not been finalized yet.
    pub fn active_runs(&self) -> Vec<RunStatus> {
        let runs = self.inner.runs.read().unwrap_or_else(|p| p.into_inner());
        let mut active: Vec<RunStatus> = runs
            .values()
            .map(|entry| entry.status.borrow().clone())
            .filter(|status| !status.is_terminal())
            .collect();
        active.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        active
    }

    /// Request cancellation. Observed while queued and between stages; a no-op
    /// for terminated runs.
    pub fn cancel(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let runs = self.inner.runs.read().unwrap_or_else(|p| p.into_inner());
        match runs.get(run_id) {
            Some(entry) => {
                if !entry.status.borrow().is_terminal() {
                    log::info!("[Orchestrator] Cancellation requested for {}", run_id);
                    entry.cancel.send_replace(true);
                }
                Ok(())
            }
            None => {
                drop(runs);
                self.find_report(run_id).map(|_| ())
            }
        }
    }

    /// Wait for a run to terminate and return its report.
    pub async fn wait(&self, run_id: &str) -> Result<BuildReport, OrchestratorError> {
        let rx = {
            let runs = self.inner.runs.read().unwrap_or_else(|p| p.into_inner());
            runs.get(run_id).map(|entry| entry.report.clone())
        };
        let Some(mut rx) = rx else {
            return self.find_report(run_id);
        };
        let report = rx
            .wait_for(|report| report.is_some())
            .await
            .map_err(|_| OrchestratorError::RunNotFound(run_id.to_string()))?
            .clone();
        report.ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.inner.events.subscribe()
    }

    /// Every registered device, ordered by codename.
    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.inner
            .registry
            .list()
            .iter()
            .map(DeviceSummary::from)
            .collect()
    }

    pub fn device(&self, codename: &str) -> Result<DeviceInfo, ValidationError> {
        self.inner.registry.lookup(codename)
    }

    pub fn compatibility(&self, codename: &str, flavor: RecoveryFlavor) -> (bool, String) {
        self.inner.registry.compatibility(codename, flavor)
    }

    pub fn add_custom_device(
        &self,
        device: DeviceInfo,
        tree_url: &str,
        kernel_url: Option<&str>,
    ) -> Result<DeviceInfo, OrchestratorError> {
        self.inner
            .registry
            .add_custom_device(device, tree_url, kernel_url)
    }

    pub fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>, OrchestratorError> {
        Ok(self.inner.artifacts.list_artifacts(filter)?)
    }

    /// Reports of terminated runs, newest first.
    pub fn history(&self) -> Result<Vec<BuildReport>, OrchestratorError> {
        Ok(self.inner.artifacts.history()?)
    }

    pub fn statistics(&self) -> Statistics {
        self.inner.artifacts.statistics()
    }

    fn find_report(&self, run_id: &str) -> Result<BuildReport, OrchestratorError> {
        self.inner
            .artifacts
            .history()?
            .into_iter()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))
    }
}

impl Inner {
    fn release(&self, fingerprint: &str) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(fingerprint);
    }

    /// Body of the per-run task: admission, stages, finalization.
    async fn drive(
        &self,
        mut run: BuildRun,
        log: LogCollector,
        mut cancel: watch::Receiver<bool>,
        status_tx: watch::Sender<RunStatus>,
        report_tx: watch::Sender<Option<BuildReport>>,
    ) {
        let events = self.events.clone();
        let run_id = run.id.clone();
        let publish = |run: &BuildRun| {
            let stage_changed = status_tx.borrow().stage != run.stage;
            status_tx.send_replace(run.status());
            if stage_changed && !run.stage.is_terminal() {
                let _ = events.send(BuildEvent::StageChanged {
                    run_id: run_id.clone(),
                    stage: run.stage,
                });
            }
        };

        let permit = tokio::select! {
            permit = Arc::clone(&self.admission).acquire_owned() => permit.ok(),
            _ = cancelled(&mut cancel) => None,
        };

        match permit {
            Some(_permit) => {
                self.pipeline.execute(&mut run, &log, &cancel, &publish).await;
                self.finish(&mut run, &log, &publish, &report_tx).await;
            }
            None => {
                log.log_parsed("Cancelled while queued");
                log::warn!("[Orchestrator] [QUEUED] {} cancelled before admission", run.id);
                run.fail(BuildError::Cancelled);
                publish(&run);
                self.finish(&mut run, &log, &publish, &report_tx).await;
            }
        }
    }

    async fn finish(
        &self,
        run: &mut BuildRun,
        log: &LogCollector,
        publish: &(dyn Fn(&BuildRun) + Send + Sync),
        report_tx: &watch::Sender<Option<BuildReport>>,
    ) {
        let (report, persisted) = match self.artifacts.finalize(run, log).await {
            Ok(report) => (report, true),
            Err(e) => {
                log::error!("[Orchestrator] Finalizing {} failed: {}", run.id, e);
                (BuildReport::from_run(run), false)
            }
        };
        publish(run);

        self.release(run.config.fingerprint());
        let outcome = report.outcome;
        let failed_stage = report.failed_stage;
        report_tx.send_replace(Some(report));

        // Once the report is on disk, status and wait are answered from it.
        if persisted {
            let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
            runs.remove(&run.id);
        }

        log::info!(
            "[Orchestrator] [{}] {} finished: {}",
            run.stage,
            run.id,
            outcome
        );
        let _ = self.events.send(BuildEvent::Finished {
            run_id: run.id.clone(),
            outcome,
            failed_stage,
        });
    }
}

/// Resolves once cancellation is requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Status for a run known only through its report.
fn status_from_report(report: &BuildReport) -> RunStatus {
    RunStatus {
        run_id: report.run_id.clone(),
        device: report.device.clone(),
        flavor: report.flavor,
        version: report.version.clone(),
        fingerprint: report.fingerprint.clone(),
        stage: match report.outcome {
            BuildOutcome::Success => BuildStage::Done,
            BuildOutcome::Failed => BuildStage::Failed,
        },
        failed_stage: report.failed_stage,
        outcome: Some(report.outcome),
        error: report.error.clone(),
        error_kind: report.error_kind.clone(),
        submitted_at: report.started_at,
        started_at: Some(report.started_at),
        ended_at: Some(report.ended_at),
        stages: report
            .stages
            .iter()
            .map(|s| StageRecord {
                name: s.name,
                started_at: s.started_at,
                ended_at: s.ended_at,
                status: s.status,
                error: s.error.clone(),
                attempts: s.attempts,
            })
            .collect(),
        log_tail: Vec::new(),
    }
}
