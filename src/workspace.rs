//! Workspace Manager: the single owner of on-disk layout.
//!
//! Every well-known path the builder touches is computed here from the workspace
//! root and a named subdirectory. Directories are created lazily and idempotently
//! (`create_dir_all`), so concurrent callers never race into an error.
//!
//! ```text
//! <root>/
//!   sources/{twrp,orange_fox,device_trees,custom_trees}/
//!   builds/{twrp,orange_fox,custom}/<run_id>/{out,staging}/
//!   artifacts/
//!   roomservice/roomservice_<device>.xml
//!   logs/
//!   cache/
//!   tools/
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::devices::DeviceInfo;
use crate::models::RecoveryFlavor;

/// Format used for `{timestamp}` in artifact names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Source trees under `sources/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTree {
    Twrp,
    OrangeFox,
    DeviceTrees,
    CustomTrees,
}

/// Build output trees under `builds/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildTree {
    Twrp,
    OrangeFox,
    Custom,
}

/// Well-known workspace subdirectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceDir {
    Sources(SourceTree),
    Builds(BuildTree),
    Artifacts,
    Roomservice,
    Logs,
    Cache,
    Tools,
}

impl WorkspaceDir {
    pub const ALL: [WorkspaceDir; 12] = [
        WorkspaceDir::Sources(SourceTree::Twrp),
        WorkspaceDir::Sources(SourceTree::OrangeFox),
        WorkspaceDir::Sources(SourceTree::DeviceTrees),
        WorkspaceDir::Sources(SourceTree::CustomTrees),
        WorkspaceDir::Builds(BuildTree::Twrp),
        WorkspaceDir::Builds(BuildTree::OrangeFox),
        WorkspaceDir::Builds(BuildTree::Custom),
        WorkspaceDir::Artifacts,
        WorkspaceDir::Roomservice,
        WorkspaceDir::Logs,
        WorkspaceDir::Cache,
        WorkspaceDir::Tools,
    ];

    /// Relative path of the directory under the workspace root.
    pub fn relative(&self) -> &'static str {
        match self {
            WorkspaceDir::Sources(SourceTree::Twrp) => "sources/twrp",
            WorkspaceDir::Sources(SourceTree::OrangeFox) => "sources/orange_fox",
            WorkspaceDir::Sources(SourceTree::DeviceTrees) => "sources/device_trees",
            WorkspaceDir::Sources(SourceTree::CustomTrees) => "sources/custom_trees",
            WorkspaceDir::Builds(BuildTree::Twrp) => "builds/twrp",
            WorkspaceDir::Builds(BuildTree::OrangeFox) => "builds/orange_fox",
            WorkspaceDir::Builds(BuildTree::Custom) => "builds/custom",
            WorkspaceDir::Artifacts => "artifacts",
            WorkspaceDir::Roomservice => "roomservice",
            WorkspaceDir::Logs => "logs",
            WorkspaceDir::Cache => "cache",
            WorkspaceDir::Tools => "tools",
        }
    }

    /// Flavor-level source checkout.
    pub fn flavor_sources(flavor: RecoveryFlavor) -> Self {
        match flavor {
            RecoveryFlavor::Twrp => WorkspaceDir::Sources(SourceTree::Twrp),
            RecoveryFlavor::OrangeFox => WorkspaceDir::Sources(SourceTree::OrangeFox),
        }
    }

    /// Build tree for a device/flavor pair; custom devices build under `builds/custom`.
    pub fn builds_for(device: &DeviceInfo, flavor: RecoveryFlavor) -> Self {
        if device.custom {
            return WorkspaceDir::Builds(BuildTree::Custom);
        }
        match flavor {
            RecoveryFlavor::Twrp => WorkspaceDir::Builds(BuildTree::Twrp),
            RecoveryFlavor::OrangeFox => WorkspaceDir::Builds(BuildTree::OrangeFox),
        }
    }
}

impl fmt::Display for WorkspaceDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative())
    }
}

impl FromStr for WorkspaceDir {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_matches('/');
        WorkspaceDir::ALL
            .iter()
            .copied()
            .find(|d| d.relative() == wanted)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' is not a well-known workspace directory", s),
                )
            })
    }
}

/// Owner of the workspace layout.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    last_stamp: Mutex<Option<DateTime<Local>>>,
}

impl Workspace {
    /// Anchor a workspace at `root`. Nothing is created until a path is ensured.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "workspace root cannot be empty",
            ));
        }
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Workspace {
            root,
            last_stamp: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a well-known directory, without creating it.
    pub fn path(&self, dir: WorkspaceDir) -> PathBuf {
        self.root.join(dir.relative())
    }

    /// Create (if needed) and return a well-known directory.
    pub fn ensure(&self, dir: WorkspaceDir) -> io::Result<PathBuf> {
        let path = self.path(dir);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// `ensure` addressed by relative name, e.g. `"artifacts"` or `"sources/twrp"`.
    pub fn ensure_named(&self, name: &str) -> io::Result<PathBuf> {
        self.ensure(name.parse()?)
    }

    /// Create the complete layout.
    pub fn init_layout(&self) -> io::Result<()> {
        for dir in WorkspaceDir::ALL {
            self.ensure(dir)?;
        }
        log::info!("[Workspace] Layout ready at {}", self.root.display());
        Ok(())
    }

    /// Synced device tree; custom devices live under `sources/custom_trees`.
    pub fn device_tree_dir(&self, device: &DeviceInfo) -> io::Result<PathBuf> {
        let parent = if device.custom {
            self.ensure(WorkspaceDir::Sources(SourceTree::CustomTrees))?
        } else {
            self.ensure(WorkspaceDir::Sources(SourceTree::DeviceTrees))?
        };
        Ok(parent.join(device.tree_dir_name()))
    }

    /// Per-run build directory, keyed by run id.
    pub fn run_build_dir(
        &self,
        device: &DeviceInfo,
        flavor: RecoveryFlavor,
        run_id: &str,
    ) -> io::Result<PathBuf> {
        let dir = self
            .ensure(WorkspaceDir::builds_for(device, flavor))?
            .join(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where a run's image and archive wait until VERIFY promotes them.
    pub fn run_staging_dir(
        &self,
        device: &DeviceInfo,
        flavor: RecoveryFlavor,
        run_id: &str,
    ) -> io::Result<PathBuf> {
        let dir = self.run_build_dir(device, flavor, run_id)?.join("staging");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn roomservice_file(&self, codename: &str) -> io::Result<PathBuf> {
        Ok(self
            .ensure(WorkspaceDir::Roomservice)?
            .join(format!("roomservice_{}.xml", codename)))
    }

    /// Append-only log written while a run executes.
    pub fn run_log_file(&self, run_id: &str) -> io::Result<PathBuf> {
        Ok(self
            .ensure(WorkspaceDir::Logs)?
            .join(format!("{}.log", run_id)))
    }

    /// Process-wide log of the CLI, next to the run logs.
    pub fn process_log_file(&self) -> io::Result<PathBuf> {
        Ok(self.ensure(WorkspaceDir::Logs)?.join("recovery_builder.log"))
    }

    pub fn artifact_path(&self, file_name: &str) -> io::Result<PathBuf> {
        Ok(self.ensure(WorkspaceDir::Artifacts)?.join(file_name))
    }

    pub fn build_env_script(&self) -> io::Result<PathBuf> {
        Ok(self.ensure(WorkspaceDir::Tools)?.join("build_env.sh"))
    }

    pub fn ccache_dir(&self) -> io::Result<PathBuf> {
        let dir = self.ensure(WorkspaceDir::Cache)?.join("ccache");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn statistics_file(&self) -> PathBuf {
        self.root.join("statistics.json")
    }

    pub fn custom_devices_file(&self) -> PathBuf {
        self.root.join("custom_devices.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("recovery_builder.toml")
    }

    /// Hand out a run timestamp that no other run in this workspace uses.
    ///
    /// Timestamps are strictly increasing within the process, and a second is
    /// skipped whenever a report for the candidate already exists on disk.
    pub fn allocate_timestamp(&self) -> DateTime<Local> {
        let mut last = self.last_stamp.lock().unwrap_or_else(|p| p.into_inner());
        let now = Local::now();
        // Truncate to whole seconds; names only carry second resolution.
        let mut candidate = now - ChronoDuration::nanoseconds(i64::from(now.timestamp_subsec_nanos()));

        if let Some(prev) = *last {
            if candidate <= prev {
                candidate = prev + ChronoDuration::seconds(1);
            }
        }
        let artifacts = self.path(WorkspaceDir::Artifacts);
        while artifacts
            .join(format!("build_report_{}.json", format_timestamp(&candidate)))
            .exists()
        {
            candidate += ChronoDuration::seconds(1);
        }

        *last = Some(candidate);
        candidate
    }
}

pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
