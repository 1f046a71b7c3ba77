//! NTFS mount orchestration.
//!
//! Mounting NTFS walks a fixed state machine:
//!
//! 1. detect the preferred driver (memoized, see [`DriverCache`]);
//! 2. resolve mount options (caller options win, then the preference table);
//! 3. primary attempt;
//! 4. on a dirty/hibernated volume: mark it dirty, publish `dirty_volume` and
//!    try a read-only mount, then stop;
//! 5. otherwise try the remaining available drivers in preference order;
//! 6. finally try a read-only mount with whatever driver the system picks.
//!
//! Attempts are strictly sequential. A `Failed` outcome is only returned once
//! every viable driver and the read-only rescue have been exhausted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::config::{DriverPreferences, READ_ONLY_MOUNT_OPTIONS};
use crate::driver::{self, DriverCache, NtfsDriver};
use crate::error::{Error, IoResultExt, Result};
use crate::events::{DriveEvent, EventBus};
use crate::inventory::DriveInventory;
use crate::logging::{self, OperationStatus};
use crate::operations::udisks_mount_request;
use crate::parse;
use crate::probe::{ProbeRequest, ProbeRunner};
use crate::record::{DriveRecord, HealthStatus};

/// Final state of one orchestration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Mounted,
    MountedReadOnly,
    /// The volume is dirty and even the read-only mount failed.
    DirtyDetected,
    Failed,
}

impl MountStatus {
    pub fn is_mounted(&self) -> bool {
        matches!(self, Self::Mounted | Self::MountedReadOnly)
    }
}

/// Bookkeeping for one orchestration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountAttempt {
    /// Drivers actually attempted, in order, without repeats.
    pub drivers_tried: Vec<NtfsDriver>,
    /// Stderr (or error text) of the most recent failed attempt.
    pub last_error: Option<String>,
    pub outcome: MountStatus,
}

impl MountAttempt {
    fn new() -> Self {
        Self {
            drivers_tried: Vec::new(),
            last_error: None,
            outcome: MountStatus::Failed,
        }
    }

    fn tried(&mut self, driver: NtfsDriver) {
        if driver.is_known() && !self.drivers_tried.contains(&driver) {
            self.drivers_tried.push(driver);
        }
    }
}

/// Result of [`NtfsMountOrchestrator::mount`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountOutcome {
    pub status: MountStatus,
    /// Recorded mount point (read-only mounts carry the display suffix).
    pub mount_point: Option<String>,
    pub attempt: MountAttempt,
}

impl MountOutcome {
    /// Turns a dirty or failed outcome into an error, for callers that only
    /// care whether the volume ended up mounted.
    pub fn into_result(self, device: &str) -> Result<MountOutcome> {
        match self.status {
            MountStatus::Mounted | MountStatus::MountedReadOnly => Ok(self),
            MountStatus::DirtyDetected => Err(Error::DirtyVolume {
                device: device.to_string(),
            }),
            MountStatus::Failed => Err(Error::Generic {
                message: self
                    .attempt
                    .last_error
                    .unwrap_or_else(|| format!("failed to mount {device}")),
                source: None,
            }),
        }
    }
}

/// Result of a single mount command.
enum Try {
    Mounted(String),
    Failed(String),
}

/// The NTFS mount state machine.
pub struct NtfsMountOrchestrator {
    runner: Arc<dyn ProbeRunner>,
    inventory: Arc<DriveInventory>,
    bus: Arc<EventBus>,
    driver: DriverCache,
    preferences: RwLock<DriverPreferences>,
    mount_timeout: Duration,
}

impl std::fmt::Debug for NtfsMountOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtfsMountOrchestrator")
            .field("driver", &self.driver.cached())
            .field("mount_timeout", &self.mount_timeout)
            .finish_non_exhaustive()
    }
}

impl NtfsMountOrchestrator {
    pub fn new(
        runner: Arc<dyn ProbeRunner>,
        inventory: Arc<DriveInventory>,
        bus: Arc<EventBus>,
        preferences: DriverPreferences,
        mount_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            inventory,
            bus,
            driver: DriverCache::new(),
            preferences: RwLock::new(preferences),
            mount_timeout,
        }
    }

    /// The preferred driver on this host (detected on first use).
    pub async fn driver(&self) -> NtfsDriver {
        self.driver.get(self.runner.as_ref()).await
    }

    /// Forgets the detected driver, e.g. after installing ntfs-3g.
    pub fn invalidate_driver(&self) {
        self.driver.invalidate();
    }

    /// Replaces the preference table with built-in defaults plus `overrides`.
    pub fn reload_preferences(&self, overrides: &BTreeMap<String, String>) {
        *self.preferences.write().unwrap_or_else(PoisonError::into_inner) =
            DriverPreferences::with_overrides(overrides);
    }

    fn options_for(&self, driver: NtfsDriver) -> String {
        self.preferences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .options_for(driver.name())
            .to_string()
    }

    /// Mounts an NTFS drive.
    ///
    /// Preconditions (drive known, NTFS, not mounted) fail with an error; every
    /// other outcome, including total failure, is reported in [`MountOutcome`].
    pub async fn mount(
        &self,
        name: &str,
        mount_point_hint: Option<&Path>,
        options: Option<&str>,
    ) -> Result<MountOutcome> {
        let record = self.inventory.get(name)?;
        if !record.is_ntfs() {
            return Err(Error::Unsupported {
                what: format!("NTFS mount of {} filesystem", record.filesystem_type),
            });
        }
        if record.is_mounted() {
            return Err(Error::DeviceMounted {
                name: name.to_string(),
            });
        }
        logging::operation("mount", name, OperationStatus::Started, "ntfs");

        let outcome = self.run_state_machine(&record, mount_point_hint, options).await?;

        match outcome.status {
            MountStatus::Mounted | MountStatus::MountedReadOnly => {
                let details = format!(
                    "{} via {:?}",
                    outcome.mount_point.as_deref().unwrap_or_default(),
                    outcome.attempt.drivers_tried
                );
                logging::operation("mount", name, OperationStatus::Success, &details);
            }
            MountStatus::DirtyDetected | MountStatus::Failed => {
                let details = format!(
                    "{}: {}",
                    if outcome.status == MountStatus::DirtyDetected { "dirty_volume" } else { "failed" },
                    outcome.attempt.last_error.as_deref().unwrap_or("unknown error")
                );
                logging::operation("mount", name, OperationStatus::Failed, &details);
            }
        }
        Ok(outcome)
    }

    async fn run_state_machine(
        &self,
        record: &DriveRecord,
        hint: Option<&Path>,
        options: Option<&str>,
    ) -> Result<MountOutcome> {
        let name = record.name.as_str();
        let device = record.device_path.display().to_string();
        let mut attempt = MountAttempt::new();

        // DetectDriver
        let primary = self.driver().await;
        let primary_options = match options.filter(|o| !o.is_empty()) {
            Some(options) => options.to_string(),
            None => self.options_for(primary),
        };

        // PrimaryAttempt
        attempt.tried(primary);
        let primary_driver = primary.is_known().then_some(primary);
        match self.try_mount(&device, primary_driver, &primary_options, hint).await? {
            Try::Mounted(mount_point) => {
                return self.finish_mounted(name, mount_point, attempt).await;
            }
            Try::Failed(stderr) => {
                tracing::warn!(device = %device, driver = %primary, stderr = %stderr.trim(), "primary mount attempt failed");
                let dirty = parse::is_dirty_mount_error(&stderr);
                attempt.last_error = Some(stderr);
                if dirty {
                    return self.dirty_recovery(name, &device, primary_driver, hint, attempt).await;
                }
            }
        }

        // FallbackAttempt
        for candidate in primary.fallback_order() {
            if !driver::is_available(self.runner.as_ref(), candidate).await {
                tracing::debug!(driver = %candidate, "fallback driver not available, skipping");
                continue;
            }
            attempt.tried(candidate);
            let options = self.options_for(candidate);
            match self.try_mount(&device, Some(candidate), &options, hint).await? {
                Try::Mounted(mount_point) => {
                    return self.finish_mounted(name, mount_point, attempt).await;
                }
                Try::Failed(stderr) => {
                    tracing::warn!(device = %device, driver = %candidate, stderr = %stderr.trim(), "fallback mount attempt failed");
                    let dirty = parse::is_dirty_mount_error(&stderr);
                    attempt.last_error = Some(stderr);
                    if dirty {
                        return self.dirty_recovery(name, &device, Some(candidate), hint, attempt).await;
                    }
                }
            }
        }

        // ReadOnlyRescue
        match self.try_mount(&device, None, READ_ONLY_MOUNT_OPTIONS, hint).await? {
            Try::Mounted(mount_point) => self.finish_read_only(name, mount_point, attempt).await,
            Try::Failed(stderr) => {
                tracing::warn!(device = %device, stderr = %stderr.trim(), "read-only rescue mount failed");
                attempt.last_error = Some(stderr);
                attempt.outcome = MountStatus::Failed;
                Ok(MountOutcome {
                    status: MountStatus::Failed,
                    mount_point: None,
                    attempt,
                })
            }
        }
    }

    async fn dirty_recovery(
        &self,
        name: &str,
        device: &str,
        driver: Option<NtfsDriver>,
        hint: Option<&Path>,
        mut attempt: MountAttempt,
    ) -> Result<MountOutcome> {
        let record = self.inventory.set_health(name, HealthStatus::Dirty).await?;
        self.bus.publish(DriveEvent::DirtyVolume(record));

        match self.try_mount(device, driver, READ_ONLY_MOUNT_OPTIONS, hint).await? {
            Try::Mounted(mount_point) => self.finish_read_only(name, mount_point, attempt).await,
            Try::Failed(stderr) => {
                tracing::warn!(device, stderr = %stderr.trim(), "read-only mount of dirty volume failed");
                attempt.last_error = Some(stderr);
                attempt.outcome = MountStatus::DirtyDetected;
                Ok(MountOutcome {
                    status: MountStatus::DirtyDetected,
                    mount_point: None,
                    attempt,
                })
            }
        }
    }

    async fn finish_mounted(
        &self,
        name: &str,
        mount_point: String,
        mut attempt: MountAttempt,
    ) -> Result<MountOutcome> {
        let record = self.inventory.apply_mount_result(name, &mount_point).await?;
        attempt.outcome = MountStatus::Mounted;
        Ok(MountOutcome {
            status: MountStatus::Mounted,
            mount_point: Some(record.mount_point),
            attempt,
        })
    }

    async fn finish_read_only(
        &self,
        name: &str,
        mount_point: String,
        mut attempt: MountAttempt,
    ) -> Result<MountOutcome> {
        let record = self.inventory.apply_read_only_mount(name, &mount_point).await?;
        attempt.outcome = MountStatus::MountedReadOnly;
        Ok(MountOutcome {
            status: MountStatus::MountedReadOnly,
            mount_point: Some(record.mount_point),
            attempt,
        })
    }

    /// Runs one mount command.
    ///
    /// Tool-level problems (missing binary, timeout) count as a failed
    /// attempt; only a mount point that cannot be created is an error.
    async fn try_mount(
        &self,
        device: &str,
        driver: Option<NtfsDriver>,
        options: &str,
        hint: Option<&Path>,
    ) -> Result<Try> {
        let (request, mount_point) = match hint {
            Some(dir) => {
                self.ensure_mount_point(dir).await?;
                let mut args = Vec::new();
                if let Some(driver) = driver {
                    args.extend(["-t".to_string(), driver.name().to_string()]);
                }
                args.extend([
                    "-o".to_string(),
                    options.to_string(),
                    device.to_string(),
                    dir.display().to_string(),
                ]);
                let request = ProbeRequest::new("mount", args)
                    .timeout(self.mount_timeout)
                    .privileged();
                (request, Some(dir.display().to_string()))
            }
            None => {
                let fstype = driver.map(|d| d.name());
                (udisks_mount_request(device, fstype, Some(options), self.mount_timeout), None)
            }
        };

        tracing::debug!(command = %request.display(), "mount attempt");
        let output = match self.runner.run(&request).await {
            Ok(output) => output,
            Err(e) => return Ok(Try::Failed(e.to_string())),
        };
        if !output.success() {
            return Ok(Try::Failed(output.stderr));
        }
        match mount_point.or_else(|| parse::mount_point_from_udisks(&output.stdout)) {
            Some(mount_point) => Ok(Try::Mounted(mount_point)),
            None => Ok(Try::Failed(format!(
                "unrecognized mount output: {}",
                output.stdout.trim()
            ))),
        }
    }

    async fn ensure_mount_point(&self, dir: &Path) -> Result<()> {
        let created = tokio::fs::create_dir_all(dir).await;
        match created {
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let path = dir.display().to_string();
                let request = ProbeRequest::new("mkdir", ["-p", path.as_str()])
                    .timeout(self.mount_timeout)
                    .privileged();
                let command = request.display();
                self.runner.run(&request).await?.into_checked(&command)?;
                Ok(())
            }
            other => other.mount_point_context(dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::events::EventKind;
    use crate::record::READ_ONLY_SUFFIX;
    use crate::testing::ScriptedRunner;

    const DRIVES: &str = r#"{"blockdevices": [
        {"name": "sdc", "size": 1000204886016, "model": "Expansion", "vendor": "Seagate",
         "rm": false, "rota": true, "tran": "usb", "type": "disk",
         "children": [
            {"name": "sdc1", "size": 1000202788864, "fstype": "ntfs", "label": "Games", "type": "part"},
            {"name": "sdc2", "size": 1000000, "fstype": "ext4", "label": "Linux", "type": "part"}
         ]}
    ]}"#;

    const LSMOD_NTFS3: &str = "Module Size Used by\nntfs3 180224 0\n";
    const NTFS3_OPTS: &str = "uid=1000,gid=1000,umask=022,windows_names,prealloc,nofail";
    const LOWNTFS_OPTS: &str = "uid=1000,gid=1000,umask=022,windows_names,ignore_case,nofail";
    const NTFS3G_OPTS: &str = "uid=1000,gid=1000,umask=022,windows_names,big_writes,nofail";

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        inventory: Arc<DriveInventory>,
        orchestrator: NtfsMountOrchestrator,
        events: tokio::sync::mpsc::UnboundedReceiver<DriveEvent>,
    }

    async fn fixture() -> Fixture {
        let runner = Arc::new(ScriptedRunner::new());
        runner.with_lsblk(DRIVES);
        runner.ok("lsmod", LSMOD_NTFS3);
        runner.ok("uname -r", "6.8.0-45-generic\n");
        let bus = Arc::new(EventBus::new());
        let inventory = Arc::new(DriveInventory::new(runner.clone(), bus.clone(), &Settings::default()));
        inventory.refresh().await.unwrap();
        let events = bus.channel();
        let orchestrator = NtfsMountOrchestrator::new(
            runner.clone(),
            inventory.clone(),
            bus,
            DriverPreferences::builtin(1000, 1000),
            Duration::from_secs(5),
        );
        Fixture {
            runner,
            inventory,
            orchestrator,
            events,
        }
    }

    fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<DriveEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn test_primary_success() {
        let mut f = fixture().await;
        f.runner.ok(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs3 -o {NTFS3_OPTS}"),
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );

        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::Mounted);
        assert_eq!(outcome.mount_point.as_deref(), Some("/media/deck/Games"));
        assert_eq!(outcome.attempt.drivers_tried, vec![NtfsDriver::Ntfs3]);
        assert_eq!(drain(&mut f.events), vec![EventKind::Mounted]);
    }

    #[tokio::test]
    async fn test_caller_options_override() {
        let f = fixture().await;
        f.runner.ok(
            "udisksctl mount -b /dev/sdc1 -t ntfs3 -o noatime",
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );
        let outcome = f.orchestrator.mount("sdc1", None, Some("noatime")).await.unwrap();
        assert_eq!(outcome.status, MountStatus::Mounted);
    }

    #[tokio::test]
    async fn test_dirty_volume_read_only() {
        let mut f = fixture().await;
        f.runner.on(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs3 -o {NTFS3_OPTS}"),
            "",
            "Volume is dirty",
            1,
        );
        f.runner.ok(
            "udisksctl mount -b /dev/sdc1 -t ntfs3 -o ro,nofail",
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );

        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::MountedReadOnly);
        let mount_point = outcome.mount_point.unwrap();
        assert!(mount_point.ends_with(READ_ONLY_SUFFIX));
        assert_eq!(
            drain(&mut f.events),
            vec![EventKind::DirtyVolume, EventKind::MountedReadOnly]
        );
        assert_eq!(f.inventory.get("sdc1").unwrap().health_status, HealthStatus::Dirty);
        // dirty volumes never go through driver fallback
        assert!(f.runner.calls_starting_with("udisksctl mount -b /dev/sdc1 -t lowntfs-3g").is_empty());
    }

    #[tokio::test]
    async fn test_read_only_marker_survives_refresh() {
        let mut f = fixture().await;
        f.runner.on(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs3 -o {NTFS3_OPTS}"),
            "",
            "Volume is dirty",
            1,
        );
        f.runner.ok(
            "udisksctl mount -b /dev/sdc1 -t ntfs3 -o ro,nofail",
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );
        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::MountedReadOnly);
        drain(&mut f.events);

        f.runner.replace_lsblk(&DRIVES.replace(
            r#""label": "Games", "type": "part""#,
            r#""label": "Games", "mountpoint": "/media/deck/Games", "type": "part""#,
        ));
        f.inventory.refresh().await.unwrap();

        let sdc1 = f.inventory.get("sdc1").unwrap();
        assert_eq!(sdc1.mount_point, format!("/media/deck/Games{READ_ONLY_SUFFIX}"));
        assert!(sdc1.is_read_only_mount());
        assert!(drain(&mut f.events).is_empty());

        // a plain mount at another path after the volume was unmounted
        f.runner.replace_lsblk(&DRIVES.replace(
            r#""label": "Games", "type": "part""#,
            r#""label": "Games", "mountpoint": "/mnt/games", "type": "part""#,
        ));
        f.inventory.refresh().await.unwrap();
        let sdc1 = f.inventory.get("sdc1").unwrap();
        assert_eq!(sdc1.mount_point, "/mnt/games");
        assert!(!sdc1.is_read_only_mount());

        f.runner.replace_lsblk(DRIVES);
        f.inventory.refresh().await.unwrap();
        assert!(f.inventory.get("sdc1").unwrap().mount_point.is_empty());
    }

    #[tokio::test]
    async fn test_dirty_volume_read_only_fails() {
        let mut f = fixture().await;
        f.runner.on(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs3 -o {NTFS3_OPTS}"),
            "",
            "Windows is hibernated, refused to mount.",
            14,
        );
        f.runner.on("udisksctl mount -b /dev/sdc1 -t ntfs3 -o ro,nofail", "", "still refused", 1);

        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::DirtyDetected);
        assert_eq!(outcome.attempt.last_error.as_deref(), Some("still refused"));
        assert_eq!(drain(&mut f.events), vec![EventKind::DirtyVolume]);
        assert!(outcome.into_result("sdc1").unwrap_err().is_dirty_volume());
    }

    #[tokio::test]
    async fn test_fallback_order_skips_unavailable() {
        let f = fixture().await;
        f.runner.with_binary("ntfs-3g");
        f.runner.on(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs3 -o {NTFS3_OPTS}"),
            "",
            "wrong fs type",
            32,
        );
        f.runner.ok(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs-3g -o {NTFS3G_OPTS}"),
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );

        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::Mounted);
        assert_eq!(
            outcome.attempt.drivers_tried,
            vec![NtfsDriver::Ntfs3, NtfsDriver::Ntfs3g]
        );
        assert!(f.runner.calls_starting_with("udisksctl mount -b /dev/sdc1 -t lowntfs-3g").is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_chain_fails_after_rescue() {
        let f = fixture().await;
        f.runner.with_binary("lowntfs-3g").with_binary("ntfs-3g");
        for (driver, opts) in [("ntfs3", NTFS3_OPTS), ("lowntfs-3g", LOWNTFS_OPTS), ("ntfs-3g", NTFS3G_OPTS)] {
            f.runner.on(
                &format!("udisksctl mount -b /dev/sdc1 -t {driver} -o {opts}"),
                "",
                &format!("{driver}: bad superblock"),
                32,
            );
        }
        f.runner.on("udisksctl mount -b /dev/sdc1 -o ro,nofail", "", "final failure", 32);

        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::Failed);
        assert_eq!(
            outcome.attempt.drivers_tried,
            vec![NtfsDriver::Ntfs3, NtfsDriver::LowNtfs3g, NtfsDriver::Ntfs3g]
        );
        assert_eq!(outcome.attempt.last_error.as_deref(), Some("final failure"));
        assert!(!f.inventory.get("sdc1").unwrap().is_mounted());
        assert_eq!(outcome.into_result("sdc1").unwrap_err().to_string(), "final failure");
    }

    #[tokio::test]
    async fn test_read_only_rescue() {
        let mut f = fixture().await;
        f.runner.on(
            &format!("udisksctl mount -b /dev/sdc1 -t ntfs3 -o {NTFS3_OPTS}"),
            "",
            "mount failed",
            32,
        );
        f.runner.ok(
            "udisksctl mount -b /dev/sdc1 -o ro,nofail",
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );
        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::MountedReadOnly);
        assert_eq!(drain(&mut f.events), vec![EventKind::MountedReadOnly]);
    }

    #[tokio::test]
    async fn test_mount_point_hint_uses_direct_mount() {
        let f = fixture().await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("games");
        let target_str = target.display().to_string();
        f.runner.ok(&format!("mount -t ntfs3 -o {NTFS3_OPTS} /dev/sdc1 {target_str}"), "");

        let outcome = f.orchestrator.mount("sdc1", Some(&target), None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::Mounted);
        assert_eq!(outcome.mount_point.as_deref(), Some(target_str.as_str()));
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_preconditions() {
        let f = fixture().await;
        let err = f.orchestrator.mount("sdc2", None, None).await.unwrap_err();
        assert_eq!(err.reason(), "unsupported");
        let err = f.orchestrator.mount("sdz9", None, None).await.unwrap_err();
        assert_eq!(err.reason(), "not_found");
    }

    #[tokio::test]
    async fn test_reload_preferences() {
        let f = fixture().await;
        let mut overrides = BTreeMap::new();
        overrides.insert("ntfs3".to_string(), "prealloc".to_string());
        f.orchestrator.reload_preferences(&overrides);
        f.runner.ok(
            "udisksctl mount -b /dev/sdc1 -t ntfs3 -o prealloc",
            "Mounted /dev/sdc1 at /media/deck/Games.\n",
        );
        let outcome = f.orchestrator.mount("sdc1", None, None).await.unwrap();
        assert_eq!(outcome.status, MountStatus::Mounted);
    }
}
