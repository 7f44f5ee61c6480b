//! Shared fixtures: a toolchain that fakes `repo`, `git` and the Android build
//! by creating the files the real tools would leave behind.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use recovery_builder::log_collector::LogCollector;
use recovery_builder::orchestrator::{ToolInvocation, ToolOutcome, ToolStep, Toolchain};
use recovery_builder::{Orchestrator, Settings};

#[derive(Default)]
pub struct SimulatedToolchain {
    /// Remaining failures per step; `usize::MAX` fails forever.
    failures: Mutex<HashMap<ToolStep, usize>>,
    hanging: Mutex<HashSet<ToolStep>>,
    delays: Mutex<HashMap<ToolStep, Duration>>,
    missing_tools: Mutex<HashSet<String>>,
    board_arch: Mutex<Option<String>>,
    board_config_pipe: AtomicBool,
    calls: Mutex<Vec<ToolInvocation>>,
    active_syncs: AtomicUsize,
    max_active_syncs: AtomicUsize,
}

impl SimulatedToolchain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, step: ToolStep) {
        self.fail_times(step, usize::MAX);
    }

    pub fn fail_times(&self, step: ToolStep, times: usize) {
        self.failures.lock().unwrap().insert(step, times);
    }

    pub fn hang_on(&self, step: ToolStep) {
        self.hanging.lock().unwrap().insert(step);
    }

    pub fn delay(&self, step: ToolStep, delay: Duration) {
        self.delays.lock().unwrap().insert(step, delay);
    }

    pub fn remove_tool(&self, name: &str) {
        self.missing_tools.lock().unwrap().insert(name.to_string());
    }

    /// `TARGET_ARCH` written into cloned BoardConfig.mk files (default arm64).
    pub fn board_arch(&self, arch: &str) {
        *self.board_arch.lock().unwrap() = Some(arch.to_string());
    }

    /// Clone device trees with BoardConfig.mk as a named pipe, so reading it
    /// blocks until a test writes the content.
    pub fn board_config_as_pipe(&self) {
        self.board_config_pipe.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, step: ToolStep) -> Vec<ToolInvocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step == step)
            .cloned()
            .collect()
    }

    pub fn max_concurrent_syncs(&self) -> usize {
        self.max_active_syncs.load(Ordering::SeqCst)
    }

    fn take_failure(&self, step: ToolStep) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&step) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }

    fn materialize(&self, invocation: &ToolInvocation) -> std::io::Result<()> {
        match invocation.step {
            ToolStep::ManifestInit => {
                std::fs::create_dir_all(invocation.cwd.join(".repo/manifests"))?;
            }
            ToolStep::TreeClone => {
                let dest = PathBuf::from(invocation.args.last().cloned().unwrap_or_default());
                std::fs::create_dir_all(dest.join(".git"))?;
                let arch = self
                    .board_arch
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| "arm64".to_string());
                let board_config = dest.join("BoardConfig.mk");
                if self.board_config_pipe.load(Ordering::SeqCst) {
                    let status = std::process::Command::new("mkfifo")
                        .arg(&board_config)
                        .status()?;
                    if !status.success() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "mkfifo failed",
                        ));
                    }
                } else {
                    std::fs::write(
                        &board_config,
                        format!("TARGET_ARCH := {}\nTARGET_ARCH_VARIANT := armv8-a\n", arch),
                    )?;
                }
                std::fs::write(dest.join("AndroidProducts.mk"), "PRODUCT_MAKEFILES :=\n")?;
            }
            ToolStep::Compile => {
                let out = invocation.env_var("OUT_DIR").unwrap_or_default();
                let device = invocation.env_var("TARGET_DEVICE").unwrap_or_default();
                let product = PathBuf::from(out).join("target/product").join(device);
                std::fs::create_dir_all(&product)?;
                std::fs::write(
                    product.join("recovery.img"),
                    format!("ANDROID!recovery image for {}", device),
                )?;
            }
            ToolStep::ProbeTool | ToolStep::ManifestSync | ToolStep::TreeUpdate => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Toolchain for SimulatedToolchain {
    async fn tool_available(&self, name: &str) -> bool {
        !self.missing_tools.lock().unwrap().contains(name)
    }

    async fn run(
        &self,
        invocation: &ToolInvocation,
        deadline: Instant,
        log: &LogCollector,
    ) -> ToolOutcome {
        self.calls.lock().unwrap().push(invocation.clone());
        log.log_str(format!("[sim] {}", invocation.command_line()));

        let is_sync = invocation.step == ToolStep::ManifestSync;
        if is_sync {
            let now = self.active_syncs.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active_syncs.fetch_max(now, Ordering::SeqCst);
        }

        let delay = self.delays.lock().unwrap().get(&invocation.step).copied();
        let hang = self.hanging.lock().unwrap().contains(&invocation.step);
        let overruns = delay.map_or(false, |d| Instant::now() + d > deadline);
        let outcome = if hang || overruns {
            tokio::time::sleep_until(deadline).await;
            ToolOutcome::TimedOut
        } else {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.take_failure(invocation.step) {
                log.log_str("[STDERR] simulated failure");
                ToolOutcome::Failed {
                    code: Some(2),
                    message: format!("simulated {:?} failure", invocation.step),
                }
            } else {
                match self.materialize(invocation) {
                    Ok(()) => ToolOutcome::Success,
                    Err(e) => ToolOutcome::Failed {
                        code: None,
                        message: e.to_string(),
                    },
                }
            }
        };

        if is_sync {
            self.active_syncs.fetch_sub(1, Ordering::SeqCst);
        }
        outcome
    }
}

pub fn settings(root: &std::path::Path) -> Settings {
    let mut settings = Settings::with_root(root);
    settings.max_concurrent_builds = 4;
    settings.jobs = 2;
    settings
}

pub fn orchestrator(settings: Settings, toolchain: &Arc<SimulatedToolchain>) -> Orchestrator {
    let toolchain: Arc<dyn Toolchain> = toolchain.clone();
    Orchestrator::new(settings, toolchain).expect("orchestrator")
}

pub fn no_options() -> HashMap<String, bool> {
    HashMap::new()
}

pub fn options(pairs: &[(&str, bool)]) -> HashMap<String, bool> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}
