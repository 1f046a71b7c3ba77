//! Generic drive operations: mount, unmount, format, repair, busy check and
//! safe eject.
//!
//! Each operation validates its preconditions against the inventory, runs the
//! external tool and, on success, updates the inventory (which publishes the
//! matching bus event). Every operation is reported through [`logging`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::classify;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::inventory::DriveInventory;
use crate::logging::{self, OperationStatus};
use crate::parse;
use crate::probe::{ProbeOutput, ProbeRequest, ProbeRunner};
use crate::record::DriveRecord;

/// Filesystems `format` can create.
pub const SUPPORTED_FORMATS: [&str; 3] = ["ntfs", "ext4", "fat32"];

/// Who holds a path open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusyState {
    pub busy: bool,
    pub processes: Vec<String>,
}

/// Builds `udisksctl mount -b <dev> [-t <fstype>] [-o <options>]`.
pub fn udisks_mount_request(
    device: &str,
    fstype: Option<&str>,
    options: Option<&str>,
    timeout: Duration,
) -> ProbeRequest {
    let mut args = vec!["mount".to_string(), "-b".to_string(), device.to_string()];
    if let Some(fstype) = fstype {
        args.extend(["-t".to_string(), fstype.to_string()]);
    }
    if let Some(options) = options.filter(|o| !o.is_empty()) {
        args.extend(["-o".to_string(), options.to_string()]);
    }
    ProbeRequest::new("udisksctl", args).timeout(timeout)
}

/// Checks whether anything holds `path` open.
///
/// Tries `lsof` first and `fuser` second; if neither is installed the path is
/// reported as not busy.
pub async fn check_busy(runner: &dyn ProbeRunner, path: &str, timeout: Duration) -> BusyState {
    let lsof = ProbeRequest::new("lsof", [path]).timeout(timeout);
    match runner.run(&lsof).await {
        Ok(output) if output.success() => {
            let processes = parse::lsof_processes(&output.stdout);
            return BusyState {
                busy: !processes.is_empty(),
                processes,
            };
        }
        // lsof exits 1 when nothing has the path open
        Ok(output) if output.exit_code == 1 && output.stdout.trim().is_empty() => {
            return BusyState::default();
        }
        Ok(output) => {
            tracing::debug!(path, exit_code = output.exit_code, "lsof gave no answer, trying fuser");
        }
        Err(e) => tracing::debug!(path, error = %e, "lsof unavailable, trying fuser"),
    }

    let fuser = ProbeRequest::new("fuser", ["-m", path]).timeout(timeout);
    match runner.run(&fuser).await {
        Ok(output) if output.success() => {
            let pids = parse::fuser_pids(&output.stdout);
            let processes = process_names(&pids);
            BusyState {
                busy: !pids.is_empty(),
                processes,
            }
        }
        Ok(_) => BusyState::default(),
        Err(e) => {
            tracing::debug!(path, error = %e, "no busy-check tool available");
            BusyState::default()
        }
    }
}

/// Resolves PIDs to process names, de-duplicated in PID order.
fn process_names(pids: &[i32]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for &pid in pids {
        let name = procfs::process::Process::new(pid)
            .and_then(|process| process.stat())
            .map(|stat| stat.comm)
            .unwrap_or_else(|_| pid.to_string());
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Runs a tool and turns a non-zero exit into [`Error::ProbeFailed`].
async fn run_checked(runner: &dyn ProbeRunner, request: ProbeRequest) -> Result<ProbeOutput> {
    let command = request.display();
    runner.run(&request).await?.into_checked(&command)
}

fn report<T>(op: &str, name: &str, result: &Result<T>) {
    match result {
        Ok(_) => logging::operation(op, name, OperationStatus::Success, ""),
        Err(e) => {
            let details = format!("{} ({})", e, e.reason());
            logging::operation(op, name, OperationStatus::Failed, &details);
        }
    }
}

/// The non-NTFS-specific operations.
pub struct DriveOperations {
    runner: Arc<dyn ProbeRunner>,
    inventory: Arc<DriveInventory>,
    probe_timeout: Duration,
    mount_timeout: Duration,
    repair_script: PathBuf,
}

impl std::fmt::Debug for DriveOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveOperations")
            .field("repair_script", &self.repair_script)
            .finish_non_exhaustive()
    }
}

impl DriveOperations {
    pub fn new(
        runner: Arc<dyn ProbeRunner>,
        inventory: Arc<DriveInventory>,
        settings: &Settings,
    ) -> Self {
        Self {
            runner,
            inventory,
            probe_timeout: settings.probe_timeout(),
            mount_timeout: settings.mount_timeout(),
            repair_script: settings.repair_script.clone(),
        }
    }

    /// Single-shot mount through the volume manager.
    pub async fn mount(&self, name: &str, options: Option<&str>) -> Result<DriveRecord> {
        logging::operation("mount", name, OperationStatus::Started, "");
        let result = self.mount_inner(name, options).await;
        report("mount", name, &result);
        result
    }

    async fn mount_inner(&self, name: &str, options: Option<&str>) -> Result<DriveRecord> {
        let record = self.inventory.get(name)?;
        if record.is_mounted() {
            return Err(Error::DeviceMounted {
                name: name.to_string(),
            });
        }
        let device = record.device_path.display().to_string();
        let request = udisks_mount_request(&device, None, options, self.mount_timeout);
        let command = request.display();
        let output = run_checked(self.runner.as_ref(), request).await?;
        let mount_point =
            parse::mount_point_from_udisks(&output.stdout).ok_or_else(|| Error::ProbeFailed {
                command,
                code: output.exit_code,
                stderr: format!("no mount point in output: {}", output.stdout.trim()),
            })?;
        self.inventory.apply_mount_result(name, &mount_point).await
    }

    /// Unmounts a drive through the volume manager.
    ///
    /// A refusal because of open handles is reported as [`Error::DeviceBusy`].
    pub async fn unmount(&self, name: &str) -> Result<DriveRecord> {
        logging::operation("unmount", name, OperationStatus::Started, "");
        let result = self.unmount_inner(name).await;
        report("unmount", name, &result);
        result
    }

    async fn unmount_inner(&self, name: &str) -> Result<DriveRecord> {
        let record = self.inventory.get(name)?;
        let Some(mount_path) = record.mount_path() else {
            return Err(Error::NotMounted {
                name: name.to_string(),
            });
        };
        let device = record.device_path.display().to_string();
        let request = ProbeRequest::new("udisksctl", ["unmount", "-b", device.as_str()])
            .timeout(self.mount_timeout);
        let command = request.display();
        let output = self.runner.run(&request).await?;
        if !output.success() {
            if output.stderr.to_lowercase().contains("busy") {
                let busy = self.check_busy(mount_path).await;
                return Err(Error::DeviceBusy {
                    device: name.to_string(),
                    processes: busy.processes,
                });
            }
            return Err(Error::ProbeFailed {
                command,
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        self.inventory.apply_unmount_result(name).await
    }

    /// Creates a new filesystem (`ntfs`, `ext4` or `fat32`) on an unmounted drive.
    pub async fn format(&self, name: &str, fstype: &str, label: Option<&str>) -> Result<DriveRecord> {
        logging::operation("format", name, OperationStatus::Started, fstype);
        let result = self.format_inner(name, fstype, label).await;
        report("format", name, &result);
        result
    }

    async fn format_inner(&self, name: &str, fstype: &str, label: Option<&str>) -> Result<DriveRecord> {
        let record = self.inventory.get(name)?;
        if record.is_mounted() {
            return Err(Error::DeviceMounted {
                name: name.to_string(),
            });
        }
        let label = label.filter(|l| !l.is_empty());
        let (program, mut args): (&str, Vec<String>) = match fstype {
            "ntfs" => ("mkfs.ntfs", vec!["-f".into()]),
            "ext4" => ("mkfs.ext4", vec!["-F".into()]),
            "fat32" => ("mkfs.vfat", vec!["-F".into(), "32".into()]),
            other => {
                return Err(Error::Unsupported {
                    what: format!("format to {other} (supported: {})", SUPPORTED_FORMATS.join(", ")),
                });
            }
        };
        if let Some(label) = label {
            let flag = if fstype == "fat32" { "-n" } else { "-L" };
            args.extend([flag.to_string(), label.to_string()]);
        }
        args.push(record.device_path.display().to_string());

        let request = ProbeRequest::new(program, args)
            .timeout(self.mount_timeout)
            .privileged();
        run_checked(self.runner.as_ref(), request).await?;
        self.refresh_and_get(name).await
    }

    /// Repairs a filesystem.
    ///
    /// A site-installed repair script takes precedence; otherwise NTFS uses
    /// `ntfsfix -d` and ext filesystems use `e2fsck -f -y`.
    pub async fn repair(&self, name: &str) -> Result<DriveRecord> {
        logging::operation("repair", name, OperationStatus::Started, "");
        let result = self.repair_inner(name).await;
        report("repair", name, &result);
        result
    }

    async fn repair_inner(&self, name: &str) -> Result<DriveRecord> {
        let record = self.inventory.get(name)?;
        if record.is_mounted() {
            return Err(Error::DeviceMounted {
                name: name.to_string(),
            });
        }
        let device = record.device_path.display().to_string();

        if self.runner.path_exists(&self.repair_script) {
            let script = self.repair_script.display().to_string();
            let request = ProbeRequest::new(&script, ["repair", name])
                .timeout(self.mount_timeout)
                .privileged();
            run_checked(self.runner.as_ref(), request).await?;
            return self.refresh_and_get(name).await;
        }

        let fstype = record.filesystem_type.as_str();
        if fstype == "ntfs" {
            let request = ProbeRequest::new("ntfsfix", ["-d", device.as_str()])
                .timeout(self.mount_timeout)
                .privileged();
            run_checked(self.runner.as_ref(), request).await?;
        } else if fstype.starts_with("ext") {
            let request = ProbeRequest::new("e2fsck", ["-f", "-y", device.as_str()])
                .timeout(self.mount_timeout)
                .privileged();
            let command = request.display();
            let output = self.runner.run(&request).await?;
            // 1 and 2 mean errors were found and corrected
            if output.exit_code > 2 {
                output.into_checked(&command)?;
            }
        } else {
            return Err(Error::Unsupported {
                what: format!(
                    "repair of {} filesystem",
                    if fstype.is_empty() { "unknown" } else { fstype }
                ),
            });
        }
        self.refresh_and_get(name).await
    }

    /// Checks who holds a path open.
    pub async fn check_busy(&self, path: &str) -> BusyState {
        check_busy(self.runner.as_ref(), path, self.probe_timeout).await
    }

    /// Unmounts everything on a drive's physical disk and powers it off.
    ///
    /// Refused with [`Error::DeviceBusy`] while any mounted partition is in use.
    pub async fn safe_eject(&self, name: &str) -> Result<()> {
        logging::operation("eject", name, OperationStatus::Started, "");
        let result = self.safe_eject_inner(name).await;
        report("eject", name, &result);
        result
    }

    async fn safe_eject_inner(&self, name: &str) -> Result<()> {
        let record = self.inventory.get(name)?;
        let disk = classify::parent_of(&record.name);

        let mounted: Vec<DriveRecord> = self
            .inventory
            .list_all()
            .into_iter()
            .filter(|r| r.is_mounted() && classify::parent_of(&r.name) == disk)
            .collect();

        for drive in &mounted {
            if let Some(path) = drive.mount_path() {
                let busy = self.check_busy(path).await;
                if busy.busy {
                    self.inventory
                        .set_busy(&drive.name, busy.processes.clone())
                        .await?;
                    return Err(Error::DeviceBusy {
                        device: drive.name.clone(),
                        processes: busy.processes,
                    });
                }
            }
        }
        for drive in &mounted {
            self.unmount_inner(&drive.name).await?;
        }

        let disk_path = format!("/dev/{disk}");
        let request = ProbeRequest::new("udisksctl", ["power-off", "-b", disk_path.as_str()])
            .timeout(self.mount_timeout);
        run_checked(self.runner.as_ref(), request).await?;
        Ok(())
    }

    /// The tool already succeeded, so a failed refresh only leaves the
    /// record stale until the next one.
    async fn refresh_and_get(&self, name: &str) -> Result<DriveRecord> {
        if let Err(e) = self.inventory.refresh().await {
            tracing::warn!(device = name, error = %e, "refresh after operation failed");
        }
        self.inventory.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventKind};
    use crate::testing::ScriptedRunner;

    const USB_STICK: &str = r#"{"blockdevices": [
        {"name": "sdb", "size": 64023257088, "model": "Ultra Fit", "vendor": "SanDisk",
         "rm": true, "tran": "usb", "type": "disk",
         "children": [
            {"name": "sdb1", "size": 32000000000, "fstype": "ext4", "label": "Linux",
             "mountpoint": "/media/deck/Linux", "type": "part"},
            {"name": "sdb2", "size": 32000000000, "fstype": "exfat", "label": "Share", "type": "part"}
         ]}
    ]}"#;

    async fn setup() -> (Arc<ScriptedRunner>, Arc<DriveInventory>, DriveOperations, Arc<EventBus>) {
        let runner = Arc::new(ScriptedRunner::new());
        runner.with_lsblk(USB_STICK);
        runner.on("lsof /media/deck/Linux", "", "", 1);
        let bus = Arc::new(EventBus::new());
        let settings = Settings::default();
        let inventory = Arc::new(DriveInventory::new(runner.clone(), bus.clone(), &settings));
        inventory.refresh().await.unwrap();
        let ops = DriveOperations::new(runner.clone(), inventory.clone(), &settings);
        (runner, inventory, ops, bus)
    }

    #[test]
    fn test_udisks_mount_request() {
        let req = udisks_mount_request("/dev/sdb1", Some("ntfs3"), Some("nofail"), Duration::from_secs(5));
        assert_eq!(req.display(), "udisksctl mount -b /dev/sdb1 -t ntfs3 -o nofail");
        let bare = udisks_mount_request("/dev/sdb1", None, Some(""), Duration::from_secs(5));
        assert_eq!(bare.display(), "udisksctl mount -b /dev/sdb1");
    }

    #[tokio::test]
    async fn test_check_busy_lsof_then_fuser() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "lsof /media/a",
            "COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\nbash 10 deck cwd DIR 8,1 4096 2 /media/a\n",
        );
        let busy = check_busy(&runner, "/media/a", Duration::from_secs(1)).await;
        assert!(busy.busy);
        assert_eq!(busy.processes, vec!["bash"]);

        let idle = check_busy(&runner, "/media/b", Duration::from_secs(1)).await;
        assert_eq!(idle, BusyState::default());
        assert_eq!(runner.calls_starting_with("fuser"), vec!["fuser -m /media/b"]);
    }

    #[tokio::test]
    async fn test_generic_mount() {
        let (runner, inventory, ops, bus) = setup().await;
        let mut events = bus.channel();
        runner.ok("udisksctl mount -b /dev/sdb2", "Mounted /dev/sdb2 at /media/deck/Share.\n");

        let record = ops.mount("sdb2", None).await.unwrap();
        assert_eq!(record.mount_point, "/media/deck/Share");
        assert_eq!(inventory.get("sdb2").unwrap().mount_point, "/media/deck/Share");
        assert_eq!(events.recv().await.unwrap().kind(), EventKind::Mounted);
    }

    #[tokio::test]
    async fn test_unmount_requires_mount_point() {
        let (_runner, _inventory, ops, _bus) = setup().await;
        let err = ops.unmount("sdb2").await.unwrap_err();
        assert_eq!(err.reason(), "not_mounted");
    }

    #[tokio::test]
    async fn test_unmount_busy_lists_processes() {
        let (runner, _inventory, ops, _bus) = setup().await;
        runner.on("udisksctl unmount -b /dev/sdb1", "", "Error unmounting: target is busy", 1);
        runner.forget("lsof /media/deck/Linux");
        runner.ok(
            "lsof /media/deck/Linux",
            "COMMAND PID USER\nvim 42 deck cwd DIR 8,17 4096 2 /media/deck/Linux\n",
        );
        match ops.unmount("sdb1").await {
            Err(Error::DeviceBusy { processes, .. }) => assert_eq!(processes, vec!["vim"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_format_refuses_mounted_drive() {
        let (runner, _inventory, ops, _bus) = setup().await;
        let err = ops.format("sdb1", "ext4", None).await.unwrap_err();
        assert_eq!(err.reason(), "mounted");
        assert!(runner.calls_starting_with("mkfs").is_empty());
    }

    #[tokio::test]
    async fn test_format_unsupported_and_success() {
        let (runner, _inventory, ops, _bus) = setup().await;
        let err = ops.format("sdb2", "btrfs", None).await.unwrap_err();
        assert_eq!(err.reason(), "unsupported");

        runner.ok("mkfs.vfat -F 32 -n SHARE /dev/sdb2", "");
        ops.format("sdb2", "fat32", Some("SHARE")).await.unwrap();
        assert_eq!(runner.calls_starting_with("mkfs"), vec!["mkfs.vfat -F 32 -n SHARE /dev/sdb2"]);
    }

    #[tokio::test]
    async fn test_format_succeeds_when_refresh_fails() {
        let (runner, inventory, ops, _bus) = setup().await;
        runner.ok("mkfs.ext4 -F -L DATA /dev/sdb2", "");
        runner.replace_lsblk("lsblk: unexpected output");

        let record = ops.format("sdb2", "ext4", Some("DATA")).await.unwrap();
        assert_eq!(record.name, "sdb2");
        // stale until the next successful refresh
        assert_eq!(inventory.get("sdb2").unwrap().filesystem_type, "exfat");

        runner.replace_lsblk(&USB_STICK.replace(
            r#""fstype": "exfat", "label": "Share""#,
            r#""fstype": "ext4", "label": "DATA""#,
        ));
        inventory.refresh().await.unwrap();
        assert_eq!(inventory.get("sdb2").unwrap().filesystem_type, "ext4");
    }

    #[tokio::test]
    async fn test_repair_prefers_site_script() {
        let (runner, _inventory, ops, _bus) = setup().await;
        runner.with_path("/usr/local/bin/drive-auto-repair");
        runner.ok("/usr/local/bin/drive-auto-repair repair sdb2", "ok\n");
        ops.repair("sdb2").await.unwrap();
        assert!(runner.calls_starting_with("e2fsck").is_empty());
    }

    #[tokio::test]
    async fn test_repair_fallbacks() {
        let (runner, _inventory, ops, _bus) = setup().await;
        let err = ops.repair("sdb2").await.unwrap_err();
        assert_eq!(err.reason(), "unsupported");

        let err = ops.repair("sdb1").await.unwrap_err();
        assert_eq!(err.reason(), "mounted");
        assert!(runner.calls_starting_with("e2fsck").is_empty());
    }

    #[tokio::test]
    async fn test_safe_eject_unmounts_then_powers_off() {
        let (runner, inventory, ops, _bus) = setup().await;
        runner.ok("udisksctl unmount -b /dev/sdb1", "Unmounted /dev/sdb1.\n");
        runner.ok("udisksctl power-off -b /dev/sdb", "");

        ops.safe_eject("sdb2").await.unwrap();
        assert!(!inventory.get("sdb1").unwrap().is_mounted());
        let calls = runner.calls_starting_with("udisksctl");
        assert_eq!(
            calls,
            vec!["udisksctl unmount -b /dev/sdb1", "udisksctl power-off -b /dev/sdb"]
        );
    }

    #[tokio::test]
    async fn test_safe_eject_virtio_disk() {
        let (runner, inventory, ops, _bus) = setup().await;
        runner.replace_lsblk(&USB_STICK.replace("sdb", "vda"));
        inventory.refresh().await.unwrap();
        runner.ok("udisksctl unmount -b /dev/vda1", "Unmounted /dev/vda1.\n");
        runner.ok("udisksctl power-off -b /dev/vda", "");

        ops.safe_eject("vda2").await.unwrap();
        assert_eq!(
            runner.calls_starting_with("udisksctl"),
            vec!["udisksctl unmount -b /dev/vda1", "udisksctl power-off -b /dev/vda"]
        );
    }

    #[tokio::test]
    async fn test_safe_eject_refuses_busy() {
        let (runner, inventory, ops, _bus) = setup().await;
        runner.forget("lsof /media/deck/Linux");
        runner.ok("lsof /media/deck/Linux", "COMMAND PID\nsteam 7 deck cwd DIR\n");

        let err = ops.safe_eject("sdb").await.unwrap_err();
        assert_eq!(err.reason(), "busy");
        assert!(runner.calls_starting_with("udisksctl").is_empty());
        assert_eq!(inventory.get("sdb1").unwrap().processes_using, vec!["steam"]);
    }
}
