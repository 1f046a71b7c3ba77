//! Block device enumeration using lsblk.
//!
//! Produces a flat list of disks and partitions in tree order (each disk
//! followed by its partitions). Partitions inherit the hardware identity of
//! their disk when lsblk reports none for the partition node itself.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::classify;
use crate::error::{Error, Result};
use crate::probe::{ProbeRequest, ProbeRunner};

/// Columns requested from lsblk.
pub const LSBLK_COLUMNS: &str =
    "NAME,SIZE,FSTYPE,MOUNTPOINT,LABEL,MODEL,SERIAL,VENDOR,UUID,RM,ROTA,TRAN,TYPE";

/// One block device as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    /// Device name (e.g., "nvme0n1p2", "sda1").
    pub name: String,
    /// Name of the disk this partition belongs to.
    pub parent: Option<String>,
    pub size_bytes: u64,
    pub fstype: String,
    pub mountpoint: String,
    pub label: String,
    pub model: String,
    pub serial: String,
    pub vendor: String,
    pub uuid: String,
    pub removable: bool,
    pub rotational: bool,
    /// Transport/bus (usb, nvme, sata, ...).
    pub transport: String,
    /// lsblk TYPE column (disk, part, rom, ...).
    pub device_type: String,
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default, deserialize_with = "size_field")]
    size: u64,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, deserialize_with = "flag_field")]
    rm: bool,
    #[serde(default, deserialize_with = "flag_field")]
    rota: bool,
    #[serde(default)]
    tran: Option<String>,
    #[serde(rename = "type", default)]
    device_type: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Older lsblk prints numbers and flags as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Number(u64),
    Text(String),
}

fn size_field<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Number(n)) => n,
        Some(Loose::Text(s)) => s.trim().parse().unwrap_or(0),
        Some(Loose::Bool(_)) | None => 0,
    })
}

fn flag_field<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Bool(b)) => b,
        Some(Loose::Number(n)) => n != 0,
        Some(Loose::Text(s)) => s.trim() == "1",
        None => false,
    })
}

fn text(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

/// Parses `lsblk -J -b` output into a flat device list.
///
/// Excluded devices (`loop*`, `dm-*`) are dropped together with their children.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;
    let mut devices = Vec::new();
    collect_devices(&output.blockdevices, None, &mut devices);
    Ok(devices)
}

/// Recursively collect devices from lsblk output, including children (partitions).
fn collect_devices(
    lsblk_devices: &[LsblkDevice],
    parent: Option<&BlockDevice>,
    devices: &mut Vec<BlockDevice>,
) {
    for dev in lsblk_devices {
        if classify::is_excluded(&dev.name) {
            continue;
        }

        let mut device = BlockDevice {
            name: dev.name.clone(),
            parent: parent.map(|p| p.name.clone()),
            size_bytes: dev.size,
            fstype: text(&dev.fstype),
            mountpoint: text(&dev.mountpoint),
            label: text(&dev.label),
            model: text(&dev.model),
            serial: text(&dev.serial),
            vendor: text(&dev.vendor),
            uuid: text(&dev.uuid),
            removable: dev.rm,
            rotational: dev.rota,
            transport: text(&dev.tran),
            device_type: text(&dev.device_type),
        };

        if let Some(parent) = parent {
            inherit_identity(&mut device, parent);
        }

        devices.push(device.clone());
        collect_devices(&dev.children, Some(&device), devices);
    }
}

fn inherit_identity(child: &mut BlockDevice, parent: &BlockDevice) {
    for (field, inherited) in [
        (&mut child.model, &parent.model),
        (&mut child.serial, &parent.serial),
        (&mut child.vendor, &parent.vendor),
        (&mut child.transport, &parent.transport),
    ] {
        if field.is_empty() {
            field.clone_from(inherited);
        }
    }
    child.removable |= parent.removable;
    child.rotational |= parent.rotational;
}

/// Lists all block devices on the system.
pub async fn list_block_devices(
    runner: &dyn ProbeRunner,
    timeout: Duration,
) -> Result<Vec<BlockDevice>> {
    let request =
        ProbeRequest::new("lsblk", ["-J", "-b", "-o", LSBLK_COLUMNS]).timeout(timeout);
    let command = request.display();
    let output = runner.run(&request).await?.into_checked(&command)?;
    parse_lsblk(&output.stdout)
}
