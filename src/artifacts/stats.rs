//! Cross-run statistics, persisted as `statistics.json` in the workspace root.
//!
//! All updates go through `StatisticsStore::record`, which holds one lock for
//! the whole read-modify-persist cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ArtifactError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub builds: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_secs: f64,
    pub average_duration_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
    pub total_builds: u64,
    pub successful_builds: u64,
    pub failed_builds: u64,
    pub per_device: BTreeMap<String, DeviceStats>,
}

impl Statistics {
    /// Fold one terminated run into the aggregate.
    pub fn record(&mut self, device: &str, success: bool, duration_secs: f64) {
        self.total_builds += 1;
        if success {
            self.successful_builds += 1;
        } else {
            self.failed_builds += 1;
        }

        let entry = self.per_device.entry(device.to_string()).or_default();
        entry.builds += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_duration_secs += duration_secs.max(0.0);
        entry.average_duration_secs = entry.total_duration_secs / entry.builds as f64;
    }

    /// Fraction of successful builds, 0.0 when nothing ran.
    pub fn success_rate(&self) -> f64 {
        if self.total_builds == 0 {
            0.0
        } else {
            self.successful_builds as f64 / self.total_builds as f64
        }
    }

    pub fn device(&self, codename: &str) -> Option<&DeviceStats> {
        self.per_device.get(codename)
    }
}

/// Process-wide owner of the statistics aggregate.
pub struct StatisticsStore {
    path: PathBuf,
    inner: Mutex<Statistics>,
}

impl StatisticsStore {
    /// Load persisted statistics, starting empty when none exist. A damaged
    /// file is logged and replaced on the next update.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stats = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(stats) => stats,
                Err(e) => {
                    log::warn!(
                        "[Statistics] Ignoring unreadable {}: {}",
                        path.display(),
                        e
                    );
                    Statistics::default()
                }
            },
            Err(_) => Statistics::default(),
        };
        StatisticsStore {
            path,
            inner: Mutex::new(stats),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Statistics {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Atomically record one run and persist the result. The in-memory
    /// aggregate is updated even if persisting fails.
    pub fn record(
        &self,
        device: &str,
        success: bool,
        duration_secs: f64,
    ) -> Result<Statistics, ArtifactError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.record(device, success, duration_secs);
        let snapshot = guard.clone();
        super::write_atomic(&self.path, serde_json::to_string_pretty(&snapshot)?.as_bytes())?;
        Ok(snapshot)
    }
}
