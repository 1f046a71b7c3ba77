//! Extended drive properties and the on-demand disk check.

use std::time::Duration;

use serde::Serialize;

use crate::classify;
use crate::error::{Error, Result};
use crate::parse::{self, NtfsVolumeInfo, SmartStatus};
use crate::probe::{ProbeRequest, ProbeRunner};
use crate::record::DriveRecord;

/// Selected SMART attributes (raw values).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmartAttributes {
    pub reallocated_sectors: Option<u64>,
    pub pending_sectors: Option<u64>,
    pub power_on_hours: Option<u64>,
    pub reallocated_events: Option<u64>,
}

/// Result of one check inside a [`DiskCheckReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub details: String,
}

impl CheckResult {
    fn new(status: CheckStatus, details: impl Into<String>) -> Self {
        Self {
            status,
            details: details.into(),
        }
    }
}

/// Filesystem and SMART verdicts for one drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskCheckReport {
    pub device: String,
    pub filesystem: CheckResult,
    /// Whether the NTFS dirty bit is set.
    pub dirty: bool,
    pub smart: CheckResult,
    /// `Passed` only when every check that ran passed; `Skipped` if none ran.
    pub overall: CheckStatus,
}

fn disk_path(record: &DriveRecord) -> String {
    format!("/dev/{}", classify::parent_of(&record.name))
}

/// Reads NTFS volume details with `ntfsinfo -m`.
pub async fn ntfs_volume_info(
    runner: &dyn ProbeRunner,
    record: &DriveRecord,
    timeout: Duration,
) -> Result<NtfsVolumeInfo> {
    if !record.is_ntfs() {
        return Err(Error::Unsupported {
            what: format!("NTFS volume info on {} filesystem", record.filesystem_type),
        });
    }
    let device = record.device_path.display().to_string();
    let request = ProbeRequest::new("ntfsinfo", ["-m", device.as_str()])
        .timeout(timeout)
        .privileged();
    let command = request.display();
    let output = runner.run(&request).await?.into_checked(&command)?;
    Ok(parse::ntfsinfo(&output.stdout))
}

/// Reads wear-related SMART attributes from the drive's physical disk.
pub async fn smart_attributes(
    runner: &dyn ProbeRunner,
    record: &DriveRecord,
    timeout: Duration,
) -> Result<SmartAttributes> {
    if classify::classify(&record.name).is_virtual() {
        return Err(Error::Unsupported {
            what: format!("SMART on virtual device {}", record.name),
        });
    }
    let request = ProbeRequest::new("smartctl", ["-A".to_string(), disk_path(record)]).timeout(timeout);
    let output = runner.run(&request).await?;
    let stdout = output.stdout.as_str();
    Ok(SmartAttributes {
        reallocated_sectors: parse::smart_attribute_raw(stdout, "Reallocated_Sector_Ct"),
        pending_sectors: parse::smart_attribute_raw(stdout, "Pending_Sector"),
        power_on_hours: parse::smart_attribute_raw(stdout, "Power_On_Hours"),
        reallocated_events: parse::smart_attribute_raw(stdout, "Reallocated_Event_Count"),
    })
}

/// Runs the filesystem and SMART checks.
pub async fn run_disk_check(
    runner: &dyn ProbeRunner,
    record: &DriveRecord,
    timeout: Duration,
) -> DiskCheckReport {
    let (filesystem, dirty) = filesystem_check(runner, record, timeout).await;
    let smart = smart_check(runner, record, timeout).await;

    let executed: Vec<CheckStatus> = [filesystem.status, smart.status]
        .into_iter()
        .filter(|s| *s != CheckStatus::Skipped)
        .collect();
    let overall = if executed.is_empty() {
        CheckStatus::Skipped
    } else if executed.iter().all(|s| *s == CheckStatus::Passed) {
        CheckStatus::Passed
    } else {
        CheckStatus::Failed
    };

    DiskCheckReport {
        device: record.name.clone(),
        filesystem,
        dirty,
        smart,
        overall,
    }
}

async fn filesystem_check(
    runner: &dyn ProbeRunner,
    record: &DriveRecord,
    timeout: Duration,
) -> (CheckResult, bool) {
    if !record.is_ntfs() {
        return (CheckResult::new(CheckStatus::Skipped, "not an NTFS volume"), false);
    }
    let device = record.device_path.display().to_string();
    let request = ProbeRequest::new("ntfsfix", ["-n", device.as_str()])
        .timeout(timeout)
        .privileged();
    match runner.run(&request).await {
        Ok(output) => {
            let dirty = parse::ntfsfix_reports_dirty(&output.stdout);
            let status = if output.success() && !dirty {
                CheckStatus::Passed
            } else {
                CheckStatus::Failed
            };
            let details = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            (CheckResult::new(status, details), dirty)
        }
        Err(e) if e.is_unavailable() => (CheckResult::new(CheckStatus::Skipped, e.to_string()), false),
        Err(e) => (CheckResult::new(CheckStatus::Error, e.to_string()), false),
    }
}

async fn smart_check(runner: &dyn ProbeRunner, record: &DriveRecord, timeout: Duration) -> CheckResult {
    if classify::classify(&record.name).is_virtual() {
        return CheckResult::new(CheckStatus::Skipped, "virtual device");
    }
    let request = ProbeRequest::new("smartctl", ["-H".to_string(), disk_path(record)]).timeout(timeout);
    match runner.run(&request).await {
        Ok(output) => match parse::smart_health(&output.stdout) {
            SmartStatus::Passed => CheckResult::new(CheckStatus::Passed, "PASSED"),
            SmartStatus::Failed => CheckResult::new(CheckStatus::Failed, "FAILED"),
            SmartStatus::Unknown => CheckResult::new(CheckStatus::Error, output.stdout.trim()),
        },
        Err(e) if e.is_unavailable() => CheckResult::new(CheckStatus::Skipped, e.to_string()),
        Err(e) => CheckResult::new(CheckStatus::Error, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::device_path;
    use crate::testing::ScriptedRunner;

    fn ntfs(name: &str) -> DriveRecord {
        DriveRecord {
            name: name.to_string(),
            device_path: device_path(name),
            filesystem_type: "ntfs".to_string(),
            ..DriveRecord::default()
        }
    }

    const T: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_ntfs_volume_info() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "ntfsinfo -m /dev/sdb1",
            "Volume Information\n\tVolume Name: Games\n\tVolume Serial Number: 0A1B\n\tCluster Size: 4096\n",
        );
        let info = ntfs_volume_info(&runner, &ntfs("sdb1"), T).await.unwrap();
        assert_eq!(info.volume_name, "Games");

        let mut ext = ntfs("sdb2");
        ext.filesystem_type = "ext4".to_string();
        assert_eq!(ntfs_volume_info(&runner, &ext, T).await.unwrap_err().reason(), "unsupported");
    }

    #[tokio::test]
    async fn test_smart_attributes_from_parent_disk() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "smartctl -A /dev/sdb",
            "  5 Reallocated_Sector_Ct   0x0033   100   100   010    Pre-fail  Always       -       3\n\
             197 Current_Pending_Sector  0x0012   100   100   000    Old_age   Always       -       1\n",
        );
        let attrs = smart_attributes(&runner, &ntfs("sdb1"), T).await.unwrap();
        assert_eq!(attrs.reallocated_sectors, Some(3));
        assert_eq!(attrs.pending_sectors, Some(1));
        assert_eq!(attrs.power_on_hours, None);
    }

    #[tokio::test]
    async fn test_disk_check_dirty_fails() {
        let runner = ScriptedRunner::new();
        runner.on("ntfsfix -n /dev/sdc1", "Volume is marked to be fixed\n", "", 0);
        runner.ok(
            "smartctl -H /dev/sdc",
            "SMART overall-health self-assessment test result: PASSED\n",
        );
        let report = run_disk_check(&runner, &ntfs("sdc1"), T).await;
        assert!(report.dirty);
        assert_eq!(report.filesystem.status, CheckStatus::Failed);
        assert_eq!(report.smart.status, CheckStatus::Passed);
        assert_eq!(report.overall, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_disk_check_skips_missing_tools() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "smartctl -H /dev/sdc",
            "SMART overall-health self-assessment test result: PASSED\n",
        );
        let report = run_disk_check(&runner, &ntfs("sdc1"), T).await;
        assert_eq!(report.filesystem.status, CheckStatus::Skipped);
        assert_eq!(report.overall, CheckStatus::Passed);

        let none = ScriptedRunner::new();
        let report = run_disk_check(&none, &ntfs("zram0"), T).await;
        assert_eq!(report.overall, CheckStatus::Skipped);
    }
}
