//! Build configuration and orchestrator settings.
//!
//! # Module Structure
//!
//! - `settings`: the orchestrator settings file (`recovery_builder.toml`)
//! - `loader`: reads and writes the settings file
//! - `validator`: range checks on loaded settings
//!
//! `BuildConfig` is the immutable value object for one build request. It is
//! validated once, at construction, and carries its own fingerprint.

pub mod loader;
pub mod settings;
pub mod validator;

pub use settings::{Settings, StageTimeouts};

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use crate::devices::DeviceInfo;
use crate::error::ValidationError;
use crate::models::{BuildOption, RecoveryFlavor};

/// One validated build intent.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    device: DeviceInfo,
    flavor: RecoveryFlavor,
    version: String,
    options: BTreeSet<BuildOption>,
    fingerprint: String,
}

impl BuildConfig {
    /// Validate and freeze a build request.
    ///
    /// Option keys are checked first, so an unrecognized toggle is reported
    /// even when the device or flavor is also wrong. A toggle mapped to `false`
    /// is recognized but disabled.
    pub fn new(
        device: DeviceInfo,
        flavor: RecoveryFlavor,
        version: &str,
        options: &HashMap<String, bool>,
    ) -> Result<Self, ValidationError> {
        let options = parse_options(options)?;

        if !device.supports(flavor) {
            let supported: Vec<&str> = device
                .compatible_flavors
                .iter()
                .map(|f| f.display_name())
                .collect();
            return Err(ValidationError::IncompatibleFlavor {
                device: device.codename.clone(),
                flavor,
                reason: format!("supported flavors: {}", supported.join(", ")),
            });
        }

        let version = version.trim().to_string();
        flavor.validate_version(&version)?;

        let fingerprint = compute_fingerprint(&device.codename, flavor, &version, &options);
        Ok(BuildConfig {
            device,
            flavor,
            version,
            options,
            fingerprint,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn flavor(&self) -> RecoveryFlavor {
        self.flavor
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn options(&self) -> &BTreeSet<BuildOption> {
        &self.options
    }

    pub fn has_option(&self, option: BuildOption) -> bool {
        self.options.contains(&option)
    }

    /// Hex sha256 over device, flavor, version and sorted enabled options.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Leading characters of the fingerprint, used in run ids.
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..8]
    }

    /// Manifest branch synced for this build.
    pub fn manifest_branch(&self) -> String {
        self.flavor.manifest_branch(&self.version)
    }

    /// `lunch` target for the device.
    pub fn lunch_target(&self) -> String {
        format!("twrp_{}-eng", self.device.codename)
    }

    /// Environment derived from the configuration alone. Workspace paths
    /// (`OUT_DIR`, `CCACHE_DIR`) are added by the pipeline.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = vec![
            ("ARCH".into(), self.device.arch.clone()),
            ("ALLOW_MISSING_DEPENDENCIES".into(), "true".into()),
            ("LC_ALL".into(), "C".into()),
            ("TARGET_DEVICE".into(), self.device.codename.clone()),
        ];
        env.extend(
            self.flavor
                .version_env(&self.version)
                .into_iter()
                .map(|(k, v)| (k.to_string(), v)),
        );
        if self.has_option(BuildOption::Ccache) {
            env.push(("USE_CCACHE".into(), "1".into()));
            env.push(("CCACHE_EXEC".into(), "/usr/bin/ccache".into()));
        }
        if self.has_option(BuildOption::VerboseLogs) {
            env.push(("SHOW_COMMANDS".into(), "1".into()));
        }
        env
    }
}

impl PartialEq for BuildConfig {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for BuildConfig {}

impl Hash for BuildConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

/// Check option keys against the closed toggle set and return the enabled ones.
pub fn parse_options(
    options: &HashMap<String, bool>,
) -> Result<BTreeSet<BuildOption>, ValidationError> {
    let mut keys: Vec<&String> = options.keys().collect();
    keys.sort();

    let mut enabled = BTreeSet::new();
    for key in keys {
        let option: BuildOption = key.trim().parse()?;
        if options[key] {
            enabled.insert(option);
        }
    }
    Ok(enabled)
}

fn compute_fingerprint(
    codename: &str,
    flavor: RecoveryFlavor,
    version: &str,
    options: &BTreeSet<BuildOption>,
) -> String {
    let opts: Vec<&str> = options.iter().map(|o| o.as_str()).collect();
    let canonical = format!(
        "{}|{}|{}|{}",
        codename,
        flavor.as_str(),
        version,
        opts.join(",")
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
