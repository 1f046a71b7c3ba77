//! Unified error types for the ntfs-manager-core library.
//!
//! Uses SNAFU for context-rich error handling. The variants follow the failure
//! taxonomy the drive engine reports to its callers: unavailable tools, failed
//! probes, dirty volumes, busy devices and unsupported requests are all kept
//! apart so presentation layers can pick the most specific reason.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The external tool is not installed.
    #[snafu(display("command '{command}' is not available on this system"))]
    ProbeUnavailable { command: String },

    /// The external tool could not be spawned for another reason.
    #[snafu(display("failed to execute command '{command}'"))]
    ProbeSpawn {
        command: String,
        source: std::io::Error,
    },

    /// The tool ran but exited non-zero (or printed something unusable).
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    ProbeFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The tool did not finish in time and was killed.
    #[snafu(display("command '{command}' timed out after {}s", timeout.as_secs()))]
    ProbeTimeout { command: String, timeout: Duration },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// No drive with this name is known to the inventory.
    #[snafu(display("drive {name} not found"))]
    DeviceNotFound { name: String },

    /// The operation needs a mounted drive.
    #[snafu(display("drive {name} is not mounted"))]
    NotMounted { name: String },

    /// The operation refuses to touch a mounted drive.
    #[snafu(display("drive {name} is mounted"))]
    DeviceMounted { name: String },

    /// Device has a dirty NTFS volume.
    #[snafu(display("device {device} has a dirty NTFS volume"))]
    DirtyVolume { device: String },

    /// Open handles exist on the device.
    #[snafu(display("device {device} is busy (in use by: {})", processes.join(", ")))]
    DeviceBusy {
        device: String,
        processes: Vec<String>,
    },

    /// The requested filesystem/operation combination is not implemented.
    #[snafu(display("unsupported: {what}"))]
    Unsupported { what: String },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file exists but cannot be read.
    #[snafu(display("failed to read configuration at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for the settings schema.
    #[snafu(display("failed to parse configuration at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// User cancelled authentication dialog.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Returns true when the error means "tool not installed".
    ///
    /// Callers treat this as "feature not supported" rather than a failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::ProbeUnavailable { .. })
    }

    /// Returns true for the dedicated dirty-volume failure.
    pub fn is_dirty_volume(&self) -> bool {
        matches!(self, Error::DirtyVolume { .. })
    }

    /// Short machine-readable reason used in operation reports.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::DirtyVolume { .. } => "dirty_volume",
            Error::DeviceBusy { .. } => "busy",
            Error::Unsupported { .. } => "unsupported",
            Error::DeviceMounted { .. } => "mounted",
            Error::NotMounted { .. } => "not_mounted",
            Error::DeviceNotFound { .. } => "not_found",
            Error::ProbeUnavailable { .. } => "unavailable",
            Error::ProbeTimeout { .. } => "timeout",
            Error::AuthenticationCancelled => "cancelled",
            _ => "failed",
        }
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for configuration read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(ProbeSpawnSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        let mounted = Error::DeviceMounted {
            name: "sdb1".to_string(),
        };
        assert_eq!(mounted.reason(), "mounted");
        assert!(mounted.to_string().contains("mounted"));

        let dirty = Error::DirtyVolume {
            device: "/dev/sdc1".to_string(),
        };
        assert!(dirty.is_dirty_volume());
        assert_eq!(dirty.reason(), "dirty_volume");

        let missing = Error::ProbeUnavailable {
            command: "lsof".to_string(),
        };
        assert!(missing.is_unavailable());
        assert_eq!(missing.reason(), "unavailable");
    }

    #[test]
    fn test_busy_display_lists_processes() {
        let busy = Error::DeviceBusy {
            device: "sdb1".to_string(),
            processes: vec!["bash".to_string(), "vim".to_string()],
        };
        assert_eq!(busy.to_string(), "device sdb1 is busy (in use by: bash, vim)");
        assert_eq!(busy.reason(), "busy");
    }
}
