//! Parsers for the text output of external tools.
//!
//! Matching on tool output is fragile by nature, so each tool gets exactly one
//! parsing function here. The substrings and delimiters below mirror what the
//! tools actually print and are treated as a contract: when a tool changes its
//! wording, this file is the only place to fix.

use std::collections::BTreeMap;

use serde::Serialize;

/// Delimiter between device and mount point in `udisksctl mount` output.
pub const MOUNTED_AT_DELIMITER: &str = " at ";

/// Stderr fragments (lowercase) that mean the NTFS volume needs Windows-side
/// repair or was hibernated.
pub const DIRTY_MOUNT_MARKERS: [&str; 3] = ["dirty", "inconsistent", "hibernated"];

const SMART_HEALTH_LINE: &str = "SMART overall-health self-assessment test result:";

/// Overall SMART self-assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SmartStatus {
    #[default]
    Unknown,
    #[serde(rename = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for SmartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        })
    }
}

/// Extracts the mount point from `udisksctl mount` stdout.
///
/// `"Mounted /dev/sdb1 at /media/user/Data."` → `"/media/user/Data"`.
pub fn mount_point_from_udisks(stdout: &str) -> Option<String> {
    if !stdout.contains("Mounted") {
        return None;
    }
    let (_, rest) = stdout.split_once(MOUNTED_AT_DELIMITER)?;
    let mount_point = rest.trim().trim_end_matches('.');
    (!mount_point.is_empty()).then(|| mount_point.to_string())
}

/// Returns true if mount stderr reports a dirty, inconsistent or hibernated
/// NTFS volume.
pub fn is_dirty_mount_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    DIRTY_MOUNT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Returns true if `ntfsfix -n` stdout says the volume would be fixed.
pub fn ntfsfix_reports_dirty(stdout: &str) -> bool {
    stdout.contains("marked to be fixed") || stdout.to_lowercase().contains("dirty")
}

/// Returns true if a tool could not open the device node for lack of rights.
pub fn is_permission_denied(stdout: &str, stderr: &str) -> bool {
    [stdout, stderr].iter().any(|text| {
        let lower = text.to_lowercase();
        lower.contains("permission denied") || lower.contains("operation not permitted")
    })
}

/// Reads the overall health verdict from `smartctl -H`.
pub fn smart_health(stdout: &str) -> SmartStatus {
    stdout
        .lines()
        .find(|line| line.contains(SMART_HEALTH_LINE))
        .map(|line| {
            if line.contains("PASSED") {
                SmartStatus::Passed
            } else {
                SmartStatus::Failed
            }
        })
        .unwrap_or_default()
}

/// Reads the drive temperature from `smartctl -A`.
///
/// Looks at the first line mentioning both "Temperature" and "Celsius" and
/// returns the integer right before "Celsius".
pub fn temperature_celsius(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .filter(|line| line.contains("Temperature") && line.contains("Celsius"))
        .find_map(|line| {
            let (before, _) = line.split_once("Celsius")?;
            before.split_whitespace().last()?.parse().ok()
        })
}

/// Raw value (10th column) of a SMART attribute row in `smartctl -A`.
pub fn smart_attribute_raw(stdout: &str, attribute: &str) -> Option<u64> {
    stdout
        .lines()
        .filter(|line| line.contains(attribute))
        .find_map(|line| line.split_whitespace().nth(9)?.parse().ok())
}

/// Parses `udevadm info --query=property` output into a map.
pub fn udev_properties(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Process names from `lsof` output, de-duplicated, in first-seen order.
pub fn lsof_processes(stdout: &str) -> Vec<String> {
    let mut processes: Vec<String> = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() || line.starts_with("COMMAND") {
            continue;
        }
        let mut parts = line.split_whitespace();
        if let (Some(command), Some(_pid)) = (parts.next(), parts.next())
            && !processes.iter().any(|p| p == command)
        {
            processes.push(command.to_string());
        }
    }
    processes
}

/// PIDs printed by `fuser -m` on stdout.
pub fn fuser_pids(stdout: &str) -> Vec<i32> {
    stdout
        .split_whitespace()
        .filter_map(|token| {
            token
                .trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse()
                .ok()
        })
        .collect()
}

/// `major.minor` of a kernel release string such as `6.8.0-45-generic`.
pub fn kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Returns true if `lsmod` output lists a module.
pub fn lsmod_has_module(stdout: &str, module: &str) -> bool {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == module)
}

/// Subset of `ntfsinfo` output shown in drive properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NtfsVolumeInfo {
    pub volume_name: String,
    pub volume_serial: String,
    pub cluster_size: String,
}

/// Parses the volume lines of `ntfsinfo -m`.
pub fn ntfsinfo(stdout: &str) -> NtfsVolumeInfo {
    let mut info = NtfsVolumeInfo::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if key.contains("Volume Name") {
            info.volume_name = value;
        } else if key.contains("Volume Serial Number") {
            info.volume_serial = value;
        } else if key.contains("Cluster Size") {
            info.cluster_size = value;
        }
    }
    info
}
