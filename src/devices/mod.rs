//! Device Registry: the database of known devices and their recovery compatibility.
//!
//! The registry is versioned and append-only. Lookups read an immutable
//! `Arc<RegistrySnapshot>`; adding a custom device builds a new snapshot and swaps
//! it in, so readers never observe a half-updated record.

pub mod roomservice;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{OrchestratorError, ValidationError};
use crate::models::RecoveryFlavor;

/// Where a device tree (and optionally its kernel) is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTreeSource {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub kernel_url: Option<String>,
}

/// Identity record for one device. Never mutated after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub codename: String,
    pub display_name: String,
    pub vendor: String,
    pub arch: String,
    pub platform: String,
    pub android_version: String,
    pub compatible_flavors: Vec<RecoveryFlavor>,
    pub tree: DeviceTreeSource,
    /// User-supplied device; synced into `sources/custom_trees`.
    #[serde(default)]
    pub custom: bool,
}

impl DeviceInfo {
    pub fn supports(&self, flavor: RecoveryFlavor) -> bool {
        self.compatible_flavors.contains(&flavor)
    }

    /// Directory name of the synced device tree.
    pub fn tree_dir_name(&self) -> String {
        format!("device_{}", self.codename)
    }

    /// Path of the device tree inside an Android source checkout
    /// (`device/<vendor>/<codename>`).
    pub fn checkout_path(&self) -> String {
        format!("device/{}/{}", self.vendor.to_lowercase(), self.codename)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let codename = self.codename.trim();
        if codename.is_empty() {
            return Err(ValidationError::InvalidDevice("codename is empty".into()));
        }
        if codename
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\')
        {
            return Err(ValidationError::InvalidDevice(format!(
                "codename '{}' contains whitespace or path separators",
                self.codename
            )));
        }
        if self.compatible_flavors.is_empty() {
            return Err(ValidationError::InvalidDevice(format!(
                "{} lists no compatible recovery flavors",
                self.codename
            )));
        }
        if self.tree.url.trim().is_empty() {
            return Err(ValidationError::InvalidDevice(format!(
                "{} has no device tree location",
                self.codename
            )));
        }
        Ok(())
    }
}

/// Listing entry for `Orchestrator::list_devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub codename: String,
    pub display_name: String,
    pub vendor: String,
    pub compatible_flavors: Vec<RecoveryFlavor>,
    pub custom: bool,
}

impl From<&DeviceInfo> for DeviceSummary {
    fn from(device: &DeviceInfo) -> Self {
        DeviceSummary {
            codename: device.codename.clone(),
            display_name: device.display_name.clone(),
            vendor: device.vendor.clone(),
            compatible_flavors: device.compatible_flavors.clone(),
            custom: device.custom,
        }
    }
}

/// One immutable version of the device database.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub version: u64,
    devices: BTreeMap<String, Arc<DeviceInfo>>,
}

impl RegistrySnapshot {
    pub fn get(&self, codename: &str) -> Option<&DeviceInfo> {
        self.devices.get(codename).map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Versioned, append-only device registry.
pub struct DeviceRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes administrative writers (append + persist).
    admin: Mutex<()>,
    /// Where custom devices are persisted; `None` keeps them in memory only.
    persist_path: Option<PathBuf>,
}

impl DeviceRegistry {
    /// Registry containing only the built-in devices.
    pub fn with_builtin() -> Self {
        let devices = builtin_devices()
            .into_iter()
            .map(|d| (d.codename.clone(), Arc::new(d)))
            .collect();
        DeviceRegistry {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot {
                version: 1,
                devices,
            })),
            admin: Mutex::new(()),
            persist_path: None,
        }
    }

    /// Built-in devices plus any custom devices persisted at `persist_path`.
    ///
    /// An unreadable custom device file is logged and ignored, matching how a
    /// damaged database should never block builds of the built-in devices.
    pub fn load(persist_path: PathBuf) -> Self {
        let mut registry = Self::with_builtin();
        registry.persist_path = Some(persist_path.clone());

        match read_custom_devices(&persist_path) {
            Ok(custom) => {
                let mut snapshot = registry.current().as_ref().clone();
                for device in custom {
                    if snapshot.devices.contains_key(&device.codename) {
                        log::warn!(
                            "[Devices] Ignoring persisted custom device {}: codename already registered",
                            device.codename
                        );
                        continue;
                    }
                    if let Err(e) = device.validate() {
                        log::warn!("[Devices] Ignoring persisted custom device: {}", e);
                        continue;
                    }
                    snapshot
                        .devices
                        .insert(device.codename.clone(), Arc::new(device));
                    snapshot.version += 1;
                }
                registry.snapshot = RwLock::new(Arc::new(snapshot));
            }
            Err(e) => {
                log::warn!(
                    "[Devices] Failed to load custom devices from {}: {}",
                    persist_path.display(),
                    e
                );
            }
        }
        registry
    }

    /// Current immutable snapshot.
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    pub fn lookup(&self, codename: &str) -> Result<DeviceInfo, ValidationError> {
        self.current()
            .get(codename)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownDevice(codename.to_string()))
    }

    /// Compatibility check that fails closed and always explains itself.
    pub fn compatibility(&self, codename: &str, flavor: RecoveryFlavor) -> (bool, String) {
        match self.current().get(codename) {
            None => (
                false,
                format!("Device {} not found in database", codename),
            ),
            Some(device) if !device.supports(flavor) => {
                let supported: Vec<&str> = device
                    .compatible_flavors
                    .iter()
                    .map(|f| f.display_name())
                    .collect();
                (
                    false,
                    format!(
                        "{} ({}) does not support {}; supported: {}",
                        device.codename,
                        device.display_name,
                        flavor,
                        supported.join(", ")
                    ),
                )
            }
            Some(device) => (
                true,
                format!("Device {} is compatible with {}", device.codename, flavor),
            ),
        }
    }

    /// All devices, ordered by codename.
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.current()
            .devices
            .values()
            .map(|d| d.as_ref().clone())
            .collect()
    }

    /// Register a user-supplied device tree. Appends only: an existing codename
    /// is rejected rather than overwritten.
    pub fn add_custom_device(
        &self,
        mut device: DeviceInfo,
        tree_url: &str,
        kernel_url: Option<&str>,
    ) -> Result<DeviceInfo, OrchestratorError> {
        device.custom = true;
        device.codename = device.codename.trim().to_string();
        device.tree.url = tree_url.trim().to_string();
        device.tree.kernel_url = kernel_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        device.validate()?;

        let _admin = self.admin.lock().unwrap_or_else(|p| p.into_inner());

        let current = self.current();
        if current.devices.contains_key(&device.codename) {
            return Err(ValidationError::DuplicateDevice(device.codename).into());
        }

        let mut next = current.as_ref().clone();
        next.devices
            .insert(device.codename.clone(), Arc::new(device.clone()));
        next.version += 1;

        if let Some(path) = &self.persist_path {
            let custom: Vec<&DeviceInfo> = next
                .devices
                .values()
                .filter(|d| d.custom)
                .map(|d| d.as_ref())
                .collect();
            write_custom_devices(path, &custom)?;
        }

        let version = next.version;
        match self.snapshot.write() {
            Ok(mut guard) => *guard = Arc::new(next),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
        }

        log::info!(
            "[Devices] Registered custom device {} ({} {}), registry version {}",
            device.codename,
            device.vendor,
            device.display_name,
            version
        );
        Ok(device)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn read_custom_devices(path: &Path) -> Result<Vec<DeviceInfo>, OrchestratorError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| OrchestratorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn write_custom_devices(path: &Path, devices: &[&DeviceInfo]) -> Result<(), OrchestratorError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let json = serde_json::to_string_pretty(devices)
        .map_err(|e| OrchestratorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, json.as_bytes())?;
    tmp.persist(path).map_err(|e| OrchestratorError::Io(e.error))?;
    Ok(())
}

fn device(
    codename: &str,
    vendor: &str,
    model: &str,
    platform: &str,
    android_version: &str,
    orange_fox: bool,
) -> DeviceInfo {
    let mut compatible_flavors = vec![RecoveryFlavor::Twrp];
    if orange_fox {
        compatible_flavors.push(RecoveryFlavor::OrangeFox);
    }
    DeviceInfo {
        codename: codename.to_string(),
        display_name: model.to_string(),
        vendor: vendor.to_string(),
        arch: "arm64".to_string(),
        platform: platform.to_string(),
        android_version: android_version.to_string(),
        compatible_flavors,
        tree: DeviceTreeSource {
            url: format!(
                "https://github.com/TWRP-Team/device_{}_{}",
                vendor.to_lowercase(),
                codename
            ),
            branch: None,
            kernel_url: None,
        },
        custom: false,
    }
}

/// The devices shipped with the builder.
pub fn builtin_devices() -> Vec<DeviceInfo> {
    vec![
        // Xiaomi
        device("beryllium", "Xiaomi", "Poco F1", "sdm845", "10", true),
        device("begonia", "Xiaomi", "Redmi Note 8 Pro", "mt6768", "10", true),
        device("sweet", "Xiaomi", "Redmi Note 10 Pro", "sdm732g", "11", true),
        device("lmi", "Xiaomi", "POCO F2 Pro", "sdm865", "11", true),
        // Samsung
        device("star2lte", "Samsung", "Galaxy S9+", "exynos9810", "10", false),
        device("beyond2lte", "Samsung", "Galaxy S10+", "exynos9820", "11", false),
        // OnePlus
        device("guacamole", "OnePlus", "7 Pro", "sdm855", "11", true),
        device("hotdog", "OnePlus", "7T Pro", "sdm855+", "11", true),
        // Google
        device("sunfish", "Google", "Pixel 4a", "sdm765g", "12", false),
        device("redfin", "Google", "Pixel 5", "sdm765g", "12", false),
        device("bluejay", "Google", "Pixel 6a", "gs101", "13", false),
        // ASUS
        device("I01WD", "ASUS", "ROG Phone 3", "sdm865+", "11", false),
        // Realme
        device("RMX2061", "Realme", "6 Pro", "sdm720g", "11", true),
        device("RMX1971", "Realme", "5 Pro", "sdm712", "10", true),
    ]
}
