//! The canonical per-device record held by the inventory.

use std::path::PathBuf;

use serde::Serialize;

pub use crate::parse::SmartStatus;

/// Suffix appended to the recorded mount point of a degraded read-only mount.
///
/// Presentation layers match on it, so it is part of the record contract.
pub const READ_ONLY_SUFFIX: &str = " (READ-ONLY)";

/// Filesystem health as far as the engine can tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    /// Only ever set for NTFS volumes.
    Dirty,
    Error,
    /// Virtual devices are never probed.
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown",
            Self::Healthy => "Healthy",
            Self::Dirty => "Dirty",
            Self::Error => "Error",
            Self::NotApplicable => "N/A",
        })
    }
}

/// Display status derived from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    Mounted,
    DirtyNeedsRepair,
    Error,
    HotSwapReady,
}

impl std::fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Mounted => "Mounted",
            Self::DirtyNeedsRepair => "Dirty - Needs Repair",
            Self::Error => "Error",
            Self::HotSwapReady => "Ready for Hot-Swap",
        })
    }
}

/// One block device or partition.
///
/// Empty strings mean "unknown" (filesystem, label, identity) or "not
/// mounted" (`mount_point`). A temperature of 0 means unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriveRecord {
    /// Kernel device name, unique within the inventory.
    pub name: String,
    pub device_path: PathBuf,
    pub size_bytes: u64,
    pub filesystem_type: String,
    pub mount_point: String,
    pub label: String,
    pub model: String,
    pub vendor: String,
    pub serial: String,
    pub uuid: String,
    pub is_removable: bool,
    pub is_rotational: bool,
    pub health_status: HealthStatus,
    pub temperature_celsius: u32,
    pub smart_status: SmartStatus,
    pub is_hot_swappable: bool,
    pub is_in_use: bool,
    pub processes_using: Vec<String>,
}

impl DriveRecord {
    /// Minimal record for a device that is no longer present.
    ///
    /// Only the name and device path are kept; size, filesystem and label
    /// are empty.
    pub fn removed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            device_path: device_path(name),
            ..Self::default()
        }
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_point.is_empty()
    }

    pub fn is_ntfs(&self) -> bool {
        self.filesystem_type == "ntfs"
    }

    /// Returns true if the current mount is the degraded read-only rescue.
    pub fn is_read_only_mount(&self) -> bool {
        self.mount_point.ends_with(READ_ONLY_SUFFIX)
    }

    /// Mount point with any read-only display suffix removed.
    pub fn mount_path(&self) -> Option<&str> {
        let path = self
            .mount_point
            .strip_suffix(READ_ONLY_SUFFIX)
            .unwrap_or(&self.mount_point);
        (!path.is_empty()).then_some(path)
    }

    /// Derives the display status.
    ///
    /// Unmounted drives are considered ready for hot-swap unless they are
    /// dirty or in a known-filesystem error state.
    pub fn status(&self) -> DriveStatus {
        if self.is_mounted() {
            DriveStatus::Mounted
        } else if self.health_status == HealthStatus::Dirty {
            DriveStatus::DirtyNeedsRepair
        } else if self.health_status == HealthStatus::Error && !self.filesystem_type.is_empty() {
            DriveStatus::Error
        } else {
            DriveStatus::HotSwapReady
        }
    }

    /// Compares two observations of the same device, ignoring temperature.
    pub fn differs_from(&self, other: &DriveRecord) -> bool {
        let mut a = self.clone();
        a.temperature_celsius = other.temperature_celsius;
        a != *other
    }

    /// Human-readable size, e.g. `"931.5 GB"`.
    pub fn size_display(&self) -> String {
        human_size(self.size_bytes)
    }
}

/// `/dev/<name>`.
pub fn device_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{name}"))
}

/// Formats a byte count with binary units.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
