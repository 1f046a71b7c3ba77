//! The drive inventory: authoritative in-memory view of all block devices.
//!
//! A refresh enumerates devices with lsblk, probes every device for identity,
//! label, health, temperature, SMART and busy state, diffs the result against
//! the previous snapshot and swaps it in. Individual probe failures only
//! degrade fields to their "unknown" values.
//!
//! Writers (refreshes and single-record updates) are serialized by an async
//! mutex held for the whole operation. Readers only take the snapshot lock
//! for the time it takes to clone, so they see either the old or the new
//! snapshot, never a mix.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::classify::{self, DeviceKind};
use crate::config::Settings;
use crate::disk::{self, BlockDevice};
use crate::error::{Error, Result};
use crate::events::{DriveEvent, EventBus};
use crate::operations;
use crate::parse::{self, SmartStatus};
use crate::probe::{ProbeRequest, ProbeRunner};
use crate::record::{DriveRecord, HealthStatus, READ_ONLY_SUFFIX, device_path};

/// Buses and transports that support hot-plugging.
const HOT_PLUG_BUSES: [&str; 4] = ["usb", "thunderbolt", "firewire", "ieee1394"];

/// Vendor names recognized in NVMe model strings, which carry no vendor field.
const KNOWN_NVME_VENDORS: [(&str, &str); 12] = [
    ("samsung", "Samsung"),
    ("wdc", "Western Digital"),
    ("wd_black", "Western Digital"),
    ("western digital", "Western Digital"),
    ("crucial", "Crucial"),
    ("micron", "Micron"),
    ("kingston", "Kingston"),
    ("intel", "Intel"),
    ("sk hynix", "SK hynix"),
    ("seagate", "Seagate"),
    ("sabrent", "Sabrent"),
    ("kioxia", "KIOXIA"),
];

/// Identity value for devices that have no hardware behind them.
const NOT_APPLICABLE: &str = "N/A";

/// Differences between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    pub added: Vec<DriveRecord>,
    /// Synthesized minimal records of devices that disappeared.
    pub removed: Vec<DriveRecord>,
    /// New versions of records whose attributes changed (temperature ignored).
    pub changed: Vec<DriveRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn added_names(&self) -> Vec<&str> {
        self.added.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn removed_names(&self) -> Vec<&str> {
        self.removed.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn changed_names(&self) -> Vec<&str> {
        self.changed.iter().map(|r| r.name.as_str()).collect()
    }
}

/// Merge-compares two snapshots ordered by name.
pub fn diff_snapshots(
    old: &BTreeMap<String, DriveRecord>,
    new: &BTreeMap<String, DriveRecord>,
) -> DiffResult {
    let mut diff = DiffResult::default();
    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        match (old_iter.peek().copied(), new_iter.peek().copied()) {
            (Some((old_name, before)), Some((new_name, after))) => match old_name.cmp(new_name) {
                Ordering::Less => {
                    diff.removed.push(DriveRecord::removed(old_name));
                    old_iter.next();
                }
                Ordering::Greater => {
                    diff.added.push(after.clone());
                    new_iter.next();
                }
                Ordering::Equal => {
                    if before.differs_from(after) {
                        diff.changed.push(after.clone());
                    }
                    old_iter.next();
                    new_iter.next();
                }
            },
            (Some((old_name, _)), None) => {
                diff.removed.push(DriveRecord::removed(old_name));
                old_iter.next();
            }
            (None, Some((_, record))) => {
                diff.added.push(record.clone());
                new_iter.next();
            }
            (None, None) => break,
        }
    }
    diff
}

/// Temperature and SMART verdict of one physical disk.
type SmartReading = (u32, SmartStatus);

/// Per-disk probe results shared by a disk and its partitions within one refresh.
#[derive(Default)]
struct RefreshCache {
    smart: HashMap<String, SmartReading>,
    udev: HashMap<String, BTreeMap<String, String>>,
}

/// Owner of the drive snapshot.
pub struct DriveInventory {
    runner: Arc<dyn ProbeRunner>,
    bus: Arc<EventBus>,
    probe_timeout: Duration,
    sysfs_block_root: PathBuf,
    snapshot: RwLock<BTreeMap<String, DriveRecord>>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for DriveInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveInventory")
            .field("drives", &self.read().len())
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl DriveInventory {
    pub fn new(runner: Arc<dyn ProbeRunner>, bus: Arc<EventBus>, settings: &Settings) -> Self {
        Self {
            runner,
            bus,
            probe_timeout: settings.probe_timeout(),
            sysfs_block_root: settings.sysfs_block_root.clone(),
            snapshot: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, DriveRecord>> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DriveRecord>> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up one drive by kernel name.
    pub fn get(&self, name: &str) -> Result<DriveRecord> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                name: name.to_string(),
            })
    }

    /// All drives, sorted by name.
    pub fn list_all(&self) -> Vec<DriveRecord> {
        self.read().values().cloned().collect()
    }

    /// Re-enumerates and re-probes every device, replacing the snapshot.
    ///
    /// Publishes `removed` events before the swap, then `added`, then
    /// `mounted`/`unmounted` for changed records whose mount state flipped.
    pub async fn refresh(&self) -> Result<DiffResult> {
        let _writer = self.writer.lock().await;

        let devices = disk::list_block_devices(self.runner.as_ref(), self.probe_timeout).await?;
        let previous = self.read().clone();
        let mut cache = RefreshCache::default();
        let mut next = BTreeMap::new();
        for device in &devices {
            let mut record = self.probe_device(device, &mut cache).await;
            keep_read_only_marker(previous.get(&record.name), &mut record);
            next.insert(record.name.clone(), record);
        }

        let diff = diff_snapshots(&previous, &next);

        for record in &diff.removed {
            self.bus.publish(DriveEvent::Removed(record.clone()));
        }
        *self.write() = next;
        for record in &diff.added {
            self.bus.publish(DriveEvent::Added(record.clone()));
        }
        for record in &diff.changed {
            let was_mounted = previous.get(&record.name).is_some_and(DriveRecord::is_mounted);
            match (was_mounted, record.is_mounted()) {
                (false, true) => self.bus.publish(DriveEvent::Mounted(record.clone())),
                (true, false) => self.bus.publish(DriveEvent::Unmounted(record.clone())),
                _ => {}
            }
        }

        tracing::debug!(
            drives = devices.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "inventory refreshed"
        );
        Ok(diff)
    }

    /// Records a successful mount and publishes `mounted`.
    pub async fn apply_mount_result(&self, name: &str, mount_point: &str) -> Result<DriveRecord> {
        let record = self
            .update(name, |record| record.mount_point = mount_point.to_string())
            .await?;
        self.bus.publish(DriveEvent::Mounted(record.clone()));
        Ok(record)
    }

    /// Records a degraded read-only mount and publishes `mounted_readonly`.
    ///
    /// The recorded mount point carries [`READ_ONLY_SUFFIX`].
    pub async fn apply_read_only_mount(&self, name: &str, mount_point: &str) -> Result<DriveRecord> {
        let record = self
            .update(name, |record| {
                record.mount_point = format!("{mount_point}{READ_ONLY_SUFFIX}");
            })
            .await?;
        self.bus.publish(DriveEvent::MountedReadOnly(record.clone()));
        Ok(record)
    }

    /// Records a successful unmount and publishes `unmounted`.
    pub async fn apply_unmount_result(&self, name: &str) -> Result<DriveRecord> {
        let record = self
            .update(name, |record| {
                record.mount_point.clear();
                record.is_in_use = false;
                record.processes_using.clear();
            })
            .await?;
        self.bus.publish(DriveEvent::Unmounted(record.clone()));
        Ok(record)
    }

    /// Sets the health of one record. `Dirty` is only accepted for NTFS.
    pub async fn set_health(&self, name: &str, status: HealthStatus) -> Result<DriveRecord> {
        self.try_update(name, |record| {
            if status == HealthStatus::Dirty && !record.is_ntfs() {
                return Err(Error::Unsupported {
                    what: format!("dirty health on {} filesystem", record.filesystem_type),
                });
            }
            record.health_status = status;
            Ok(())
        })
        .await
    }

    /// Records busy state found by an explicit check.
    pub async fn set_busy(&self, name: &str, processes: Vec<String>) -> Result<DriveRecord> {
        self.update(name, |record| {
            record.is_in_use = !processes.is_empty();
            record.processes_using = processes;
        })
        .await
    }

    async fn update(&self, name: &str, apply: impl FnOnce(&mut DriveRecord)) -> Result<DriveRecord> {
        self.try_update(name, |record| {
            apply(record);
            Ok(())
        })
        .await
    }

    /// Checks and mutates one record under the writer lock. A rejected
    /// update must leave the record untouched.
    async fn try_update(
        &self,
        name: &str,
        apply: impl FnOnce(&mut DriveRecord) -> Result<()>,
    ) -> Result<DriveRecord> {
        let _writer = self.writer.lock().await;
        let mut snapshot = self.write();
        let record = snapshot.get_mut(name).ok_or_else(|| Error::DeviceNotFound {
            name: name.to_string(),
        })?;
        apply(record)?;
        Ok(record.clone())
    }

    async fn probe_device(&self, device: &BlockDevice, cache: &mut RefreshCache) -> DriveRecord {
        let kind = classify::classify(&device.name);
        let disk = device
            .parent
            .clone()
            .unwrap_or_else(|| classify::parent_of(&device.name));

        let mut record = DriveRecord {
            name: device.name.clone(),
            device_path: device_path(&device.name),
            size_bytes: device.size_bytes,
            filesystem_type: device.fstype.clone(),
            mount_point: device.mountpoint.clone(),
            label: device.label.clone(),
            model: device.model.clone(),
            vendor: device.vendor.clone(),
            serial: device.serial.clone(),
            uuid: device.uuid.clone(),
            is_removable: device.removable,
            is_rotational: device.rotational,
            ..DriveRecord::default()
        };

        self.resolve_identity(&mut record, kind, &disk, cache).await;
        if record.label.is_empty() {
            record.label = self.label_from_tool(&record).await.unwrap_or_default();
        }

        if kind.is_virtual() {
            record.health_status = HealthStatus::NotApplicable;
            record.temperature_celsius = 0;
            record.smart_status = SmartStatus::Unknown;
        } else {
            record.health_status = self.health(&record).await;
            let (temperature, smart) = self.smart_reading(&disk, cache).await;
            record.temperature_celsius = temperature;
            record.smart_status = smart;
        }

        record.is_hot_swappable = self.is_hot_swappable(device, &disk, cache).await;

        if let Some(path) = record.mount_path() {
            let busy =
                operations::check_busy(self.runner.as_ref(), path, self.probe_timeout).await;
            record.is_in_use = busy.busy;
            record.processes_using = busy.processes;
        }

        record
    }

    /// Fills model/vendor/serial: lsblk → sysfs → udev → NVMe vendor table.
    async fn resolve_identity(
        &self,
        record: &mut DriveRecord,
        kind: DeviceKind,
        disk: &str,
        cache: &mut RefreshCache,
    ) {
        let missing = |r: &DriveRecord| r.model.is_empty() || r.vendor.is_empty() || r.serial.is_empty();

        if kind.lacks_hardware_identity() {
            for field in [&mut record.model, &mut record.vendor, &mut record.serial] {
                if field.is_empty() {
                    *field = NOT_APPLICABLE.to_string();
                }
            }
            return;
        }

        if missing(record) {
            let device_dir = self.sysfs_block_root.join(disk).join("device");
            for (field, attribute) in [
                (&mut record.model, "model"),
                (&mut record.vendor, "vendor"),
                (&mut record.serial, "serial"),
            ] {
                if field.is_empty()
                    && let Some(value) = self.runner.read_attribute(&device_dir.join(attribute)).await
                {
                    *field = value;
                }
            }
        }

        if record.model.is_empty() || record.vendor.is_empty() {
            let props = self.udev_properties(disk, cache).await;
            if record.model.is_empty()
                && let Some(model) = props.get("ID_MODEL")
            {
                record.model = model.replace('_', " ");
            }
            if record.vendor.is_empty()
                && let Some(vendor) = props.get("ID_VENDOR")
            {
                record.vendor = vendor.replace('_', " ");
            }
            if record.serial.is_empty()
                && let Some(serial) = props.get("ID_SERIAL_SHORT")
            {
                record.serial = serial.clone();
            }
        }

        if record.vendor.is_empty() && matches!(kind, DeviceKind::NvmeDisk | DeviceKind::NvmePartition) {
            record.vendor = infer_nvme_vendor(&record.model).unwrap_or_default().to_string();
        }
    }

    async fn udev_properties(&self, disk: &str, cache: &mut RefreshCache) -> BTreeMap<String, String> {
        if let Some(props) = cache.udev.get(disk) {
            return props.clone();
        }
        let request = ProbeRequest::new(
            "udevadm",
            ["info".to_string(), "--query=property".to_string(), "--name".to_string(), format!("/dev/{disk}")],
        )
        .timeout(self.probe_timeout);
        let props = match self.runner.run(&request).await {
            Ok(output) if output.success() => parse::udev_properties(&output.stdout),
            _ => BTreeMap::new(),
        };
        cache.udev.insert(disk.to_string(), props.clone());
        props
    }

    async fn label_from_tool(&self, record: &DriveRecord) -> Option<String> {
        let fstype = record.filesystem_type.as_str();
        let tool = match fstype {
            "ntfs" => "ntfslabel",
            "vfat" => "fatlabel",
            _ if fstype.starts_with("ext") => "e2label",
            _ => return None,
        };
        let request = ProbeRequest::new(tool, [record.device_path.display().to_string()])
            .timeout(self.probe_timeout);
        let output = self.runner.run(&request).await.ok()?;
        let label = output.stdout.trim();
        (output.success() && !label.is_empty()).then(|| label.to_string())
    }

    /// NTFS health from `ntfsfix -n`.
    ///
    /// Runs unprivileged so a background refresh never prompts for
    /// credentials; a device node the user cannot open yields `Unknown`.
    async fn health(&self, record: &DriveRecord) -> HealthStatus {
        if !record.is_ntfs() {
            return HealthStatus::Unknown;
        }
        let request = ProbeRequest::new("ntfsfix", ["-n".to_string(), record.device_path.display().to_string()])
            .timeout(self.probe_timeout);
        match self.runner.run(&request).await {
            Ok(output) if parse::ntfsfix_reports_dirty(&output.stdout) => HealthStatus::Dirty,
            Ok(output) if output.success() => HealthStatus::Healthy,
            Ok(output) if parse::is_permission_denied(&output.stdout, &output.stderr) => {
                HealthStatus::Unknown
            }
            Ok(_) => HealthStatus::Error,
            Err(_) => HealthStatus::Unknown,
        }
    }

    async fn smart_reading(&self, disk: &str, cache: &mut RefreshCache) -> SmartReading {
        if let Some(reading) = cache.smart.get(disk) {
            return *reading;
        }
        let path = format!("/dev/{disk}");
        let attributes = ProbeRequest::new("smartctl", ["-A".to_string(), path.clone()])
            .timeout(self.probe_timeout);
        let temperature = match self.runner.run(&attributes).await {
            Ok(output) => parse::temperature_celsius(&output.stdout).unwrap_or(0),
            Err(_) => 0,
        };
        let health = ProbeRequest::new("smartctl", ["-H".to_string(), path]).timeout(self.probe_timeout);
        let smart = match self.runner.run(&health).await {
            Ok(output) => parse::smart_health(&output.stdout),
            Err(_) => SmartStatus::Unknown,
        };
        cache.smart.insert(disk.to_string(), (temperature, smart));
        (temperature, smart)
    }

    async fn is_hot_swappable(&self, device: &BlockDevice, disk: &str, cache: &mut RefreshCache) -> bool {
        if device.removable || HOT_PLUG_BUSES.contains(&device.transport.as_str()) {
            return true;
        }
        let props = self.udev_properties(disk, cache).await;
        if props
            .get("ID_BUS")
            .is_some_and(|bus| HOT_PLUG_BUSES.contains(&bus.as_str()))
        {
            return true;
        }
        let removable = self.sysfs_block_root.join(disk).join("removable");
        self.runner.read_attribute(&removable).await.as_deref() == Some("1")
    }
}

/// Carries the read-only display marker over a refresh while the volume
/// stays mounted at the same place; lsblk only reports the bare path.
fn keep_read_only_marker(previous: Option<&DriveRecord>, record: &mut DriveRecord) {
    let Some(previous) = previous else {
        return;
    };
    if previous.is_read_only_mount()
        && !record.mount_point.is_empty()
        && previous.mount_path() == Some(record.mount_point.as_str())
    {
        record.mount_point.push_str(READ_ONLY_SUFFIX);
    }
}

/// Looks up a vendor name in an NVMe model string.
pub fn infer_nvme_vendor(model: &str) -> Option<&'static str> {
    let model = model.to_lowercase();
    KNOWN_NVME_VENDORS
        .iter()
        .find(|(needle, _)| model.contains(needle))
        .map(|(_, vendor)| *vendor)
}
