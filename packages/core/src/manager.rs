//! The process-level context that wires the engine together.
//!
//! A [`DriveManager`] is created once by the entry point and owns the event
//! bus, inventory, NTFS orchestrator, generic operations and settings. It is
//! the only place that decides whether a mount goes through the NTFS state
//! machine or the single-shot generic path.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::classify::{self, DeviceKind};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::executor::ExecutionContext;
use crate::inventory::{DiffResult, DriveInventory};
use crate::monitor::HotplugMonitor;
use crate::ntfs::{MountAttempt, MountOutcome, MountStatus, NtfsMountOrchestrator};
use crate::operations::{BusyState, DriveOperations};
use crate::parse::NtfsVolumeInfo;
use crate::probe::{ProbeRunner, SystemProbeRunner};
use crate::properties::{self, DiskCheckReport, SmartAttributes};
use crate::record::DriveRecord;

/// Disk assumed to hold the operating system; never auto-mounted.
const SYSTEM_DISK: &str = "nvme0n1";

/// Long-lived engine context.
pub struct DriveManager {
    runner: Arc<dyn ProbeRunner>,
    bus: Arc<EventBus>,
    inventory: Arc<DriveInventory>,
    ntfs: NtfsMountOrchestrator,
    operations: DriveOperations,
    settings: Settings,
    monitor: Mutex<Option<HotplugMonitor>>,
}

impl std::fmt::Debug for DriveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveManager")
            .field("inventory", &self.inventory)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DriveManager {
    /// Builds a manager that runs real system tools.
    pub fn new(settings: Settings) -> Self {
        let ctx = ExecutionContext::with_escalation(settings.escalation);
        Self::with_runner(Arc::new(SystemProbeRunner::new(ctx)), settings)
    }

    /// Builds a manager on top of any probe runner.
    pub fn with_runner(runner: Arc<dyn ProbeRunner>, settings: Settings) -> Self {
        let bus = Arc::new(EventBus::with_logging());
        let inventory = Arc::new(DriveInventory::new(runner.clone(), bus.clone(), &settings));
        let ntfs = NtfsMountOrchestrator::new(
            runner.clone(),
            inventory.clone(),
            bus.clone(),
            settings.driver_preferences(),
            settings.mount_timeout(),
        );
        let operations = DriveOperations::new(runner.clone(), inventory.clone(), &settings);
        Self {
            runner,
            bus,
            inventory,
            ntfs,
            operations,
            settings,
            monitor: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn inventory(&self) -> &Arc<DriveInventory> {
        &self.inventory
    }

    pub fn ntfs(&self) -> &NtfsMountOrchestrator {
        &self.ntfs
    }

    pub fn operations(&self) -> &DriveOperations {
        &self.operations
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn refresh(&self) -> Result<DiffResult> {
        self.inventory.refresh().await
    }

    pub fn get(&self, name: &str) -> Result<DriveRecord> {
        self.inventory.get(name)
    }

    pub fn list_all(&self) -> Vec<DriveRecord> {
        self.inventory.list_all()
    }

    /// Mounts a drive: NTFS through the fallback state machine, anything else
    /// through the generic single-shot mount.
    pub async fn mount(
        &self,
        name: &str,
        mount_point_hint: Option<&Path>,
        options: Option<&str>,
    ) -> Result<MountOutcome> {
        let record = self.inventory.get(name)?;
        if record.is_ntfs() {
            return self.ntfs.mount(name, mount_point_hint, options).await;
        }
        if mount_point_hint.is_some() {
            return Err(Error::Unsupported {
                what: format!("mount point hint for {} filesystem", record.filesystem_type),
            });
        }
        let mounted = self.operations.mount(name, options).await?;
        Ok(MountOutcome {
            status: MountStatus::Mounted,
            mount_point: Some(mounted.mount_point),
            attempt: MountAttempt {
                drivers_tried: Vec::new(),
                last_error: None,
                outcome: MountStatus::Mounted,
            },
        })
    }

    /// Re-runs [`DriveManager::mount`] with a fixed delay until it succeeds or
    /// the configured attempts are used up.
    ///
    /// A dirty volume is final and never retried; so are precondition errors.
    pub async fn mount_with_retry(
        &self,
        name: &str,
        mount_point_hint: Option<&Path>,
        options: Option<&str>,
    ) -> Result<MountOutcome> {
        let attempts = self.settings.mount_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.mount(name, mount_point_hint, options).await;
            let retryable = match &result {
                Ok(outcome) => outcome.status == MountStatus::Failed,
                Err(e) => matches!(
                    e,
                    Error::ProbeFailed { .. } | Error::ProbeTimeout { .. } | Error::ProbeSpawn { .. }
                ),
            };
            if !retryable || attempt >= attempts {
                return result;
            }
            let reason = match &result {
                Ok(outcome) => outcome.attempt.last_error.clone().unwrap_or_default(),
                Err(e) => e.to_string(),
            };
            tracing::warn!(
                device = name,
                attempt,
                attempts,
                reason = %reason.trim(),
                "mount attempt failed, retrying"
            );
            attempt += 1;
            tokio::time::sleep(self.settings.mount_retry_delay()).await;
        }
    }

    pub async fn unmount(&self, name: &str) -> Result<DriveRecord> {
        self.operations.unmount(name).await
    }

    pub async fn format(&self, name: &str, fstype: &str, label: Option<&str>) -> Result<DriveRecord> {
        self.operations.format(name, fstype, label).await
    }

    pub async fn repair(&self, name: &str) -> Result<DriveRecord> {
        self.operations.repair(name).await
    }

    pub async fn check_busy(&self, path: &str) -> BusyState {
        self.operations.check_busy(path).await
    }

    pub async fn safe_eject(&self, name: &str) -> Result<()> {
        self.operations.safe_eject(name).await
    }

    pub async fn ntfs_volume_info(&self, name: &str) -> Result<NtfsVolumeInfo> {
        let record = self.inventory.get(name)?;
        properties::ntfs_volume_info(self.runner.as_ref(), &record, self.settings.probe_timeout()).await
    }

    pub async fn smart_attributes(&self, name: &str) -> Result<SmartAttributes> {
        let record = self.inventory.get(name)?;
        properties::smart_attributes(self.runner.as_ref(), &record, self.settings.probe_timeout()).await
    }

    pub async fn run_disk_check(&self, name: &str) -> Result<DiskCheckReport> {
        let record = self.inventory.get(name)?;
        Ok(properties::run_disk_check(self.runner.as_ref(), &record, self.settings.probe_timeout()).await)
    }

    /// Mounts every unmounted, non-removable NTFS partition outside the
    /// system disk and returns the per-device results.
    pub async fn auto_mount_internal(&self) -> Vec<(String, Result<MountOutcome>)> {
        let candidates: Vec<String> = self
            .inventory
            .list_all()
            .into_iter()
            .filter(is_auto_mount_candidate)
            .map(|record| record.name)
            .collect();

        let mut results = Vec::with_capacity(candidates.len());
        for name in candidates {
            tracing::info!(device = %name, "auto-mounting internal NTFS partition");
            let result = self.mount_with_retry(&name, None, None).await;
            results.push((name, result));
        }
        results
    }

    /// Starts the hot-plug monitor; a running monitor is left alone.
    pub async fn start_monitor(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(HotplugMonitor::is_running) {
            return Ok(());
        }
        *monitor = Some(HotplugMonitor::start(
            self.inventory.clone(),
            self.settings.settle_delay(),
        )?);
        Ok(())
    }

    /// Stops the hot-plug monitor if it is running.
    pub async fn stop_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.stop().await;
        }
    }
}

fn is_auto_mount_candidate(record: &DriveRecord) -> bool {
    record.is_ntfs()
        && !record.is_mounted()
        && !record.is_removable
        && classify::is_partition(&record.name)
        && !(classify::classify(&record.name) == DeviceKind::NvmePartition
            && classify::parent_of(&record.name) == SYSTEM_DISK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::device_path;

    fn partition(name: &str, fstype: &str) -> DriveRecord {
        DriveRecord {
            name: name.to_string(),
            device_path: device_path(name),
            filesystem_type: fstype.to_string(),
            ..DriveRecord::default()
        }
    }

    #[test]
    fn test_auto_mount_candidates() {
        assert!(is_auto_mount_candidate(&partition("sda2", "ntfs")));
        assert!(is_auto_mount_candidate(&partition("nvme1n1p1", "ntfs")));
        assert!(!is_auto_mount_candidate(&partition("nvme0n1p3", "ntfs")));
        assert!(!is_auto_mount_candidate(&partition("sda2", "ext4")));
        assert!(!is_auto_mount_candidate(&partition("sda", "ntfs")));

        let mut removable = partition("sdb1", "ntfs");
        removable.is_removable = true;
        assert!(!is_auto_mount_candidate(&removable));

        let mut mounted = partition("sda2", "ntfs");
        mounted.mount_point = "/mnt/data".to_string();
        assert!(!is_auto_mount_candidate(&mounted));
    }
}
