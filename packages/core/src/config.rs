//! User configuration and the driver preference table.
//!
//! Settings live in `$XDG_CONFIG_HOME/ntfs-manager/config.toml`. Every key is
//! optional and a missing file means all defaults.
//!
//! ```toml
//! settle_delay_ms = 750
//! escalation = "pkexec"
//!
//! [mount_options]
//! ntfs3 = "uid=1000,gid=1000,umask=022,prealloc,nofail"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, IoResultExt, Result};
use crate::executor::PrivilegeEscalation;

/// Options used when no driver is recognized.
pub const FALLBACK_MOUNT_OPTIONS: &str = "nofail";

/// Options for the degraded read-only mount.
pub const READ_ONLY_MOUNT_OPTIONS: &str = "ro,nofail";

/// Returns the current user's UID.
pub fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// Returns the current user's primary GID.
pub fn current_gid() -> u32 {
    nix::unistd::getgid().as_raw()
}

/// Default config file location, if a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ntfs-manager").join("config.toml"))
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub probe_timeout_secs: u64,
    pub mount_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub mount_retry_attempts: u32,
    pub mount_retry_delay_ms: u64,
    pub repair_script: PathBuf,
    pub sysfs_block_root: PathBuf,
    pub escalation: PrivilegeEscalation,
    /// Driver name → mount options, merged over the built-in defaults.
    pub mount_options: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 30,
            mount_timeout_secs: 120,
            settle_delay_ms: 500,
            mount_retry_attempts: 3,
            mount_retry_delay_ms: 1000,
            repair_script: PathBuf::from("/usr/local/bin/drive-auto-repair"),
            sysfs_block_root: PathBuf::from("/sys/block"),
            escalation: PrivilegeEscalation::None,
            mount_options: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).config_read_context(path)?;
        let settings: Settings = toml::from_str(&raw).context(ConfigParseSnafu { path })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(settings)
    }

    /// Loads from the default location.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn mount_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mount_retry_delay_ms)
    }

    /// Builds the driver preference table for these settings.
    pub fn driver_preferences(&self) -> DriverPreferences {
        DriverPreferences::with_overrides(&self.mount_options)
    }
}

/// Mapping from NTFS driver name to its mount-options string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPreferences {
    options: BTreeMap<String, String>,
}

impl Default for DriverPreferences {
    fn default() -> Self {
        Self::builtin(current_uid(), current_gid())
    }
}

impl DriverPreferences {
    /// Built-in defaults for the given owner.
    pub fn builtin(uid: u32, gid: u32) -> Self {
        let base = format!("uid={uid},gid={gid},umask=022,windows_names");
        let options = [
            ("ntfs3", format!("{base},prealloc,nofail")),
            ("lowntfs-3g", format!("{base},ignore_case,nofail")),
            ("ntfs-3g", format!("{base},big_writes,nofail")),
        ]
        .into_iter()
        .map(|(driver, opts)| (driver.to_string(), opts))
        .collect();
        Self { options }
    }

    /// Built-in defaults with user overrides applied on top.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut prefs = Self::default();
        for (driver, opts) in overrides {
            prefs.options.insert(driver.clone(), opts.trim().to_string());
        }
        prefs
    }

    /// Options for a driver, or [`FALLBACK_MOUNT_OPTIONS`] if unknown.
    pub fn options_for(&self, driver: &str) -> &str {
        self.options
            .get(driver)
            .map(String::as_str)
            .unwrap_or(FALLBACK_MOUNT_OPTIONS)
    }
}
