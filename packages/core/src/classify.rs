//! Device classification from kernel device names.
//!
//! Pure name-pattern rules, no I/O. The inventory uses them to decide which
//! devices to skip, which ones are virtual (no health or SMART probing) and
//! which physical disk a partition belongs to, since hardware identity
//! (model/vendor/serial) lives on the disk node rather than the partition.

use serde::Serialize;

/// Kind of block device, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// `sd[a-z]`
    Disk,
    /// `sd[a-z]<N>`
    Partition,
    /// `nvme<N>n<M>`
    NvmeDisk,
    /// `nvme<N>n<M>p<K>`
    NvmePartition,
    /// `sr*`, `cdrom*`
    Optical,
    /// `zram*`, `ram*`, `loop*`
    Virtual,
    /// `mmcblk<N>` and its `mmcblk<N>p<K>` partitions
    Mmc,
    Unknown,
}

impl DeviceKind {
    /// Virtual devices never get health, temperature or SMART probes.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual)
    }

    /// Devices without physical identity to look up.
    pub fn lacks_hardware_identity(&self) -> bool {
        matches!(self, Self::Virtual | Self::Optical)
    }
}

/// Returns true for names that never enter the inventory (`loop*`, `dm-*`).
pub fn is_excluded(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("dm-")
}

/// Classifies a kernel device name.
pub fn classify(name: &str) -> DeviceKind {
    if name.starts_with("zram") || name.starts_with("ram") || name.starts_with("loop") {
        return DeviceKind::Virtual;
    }
    if name.starts_with("sr") || name.starts_with("cdrom") {
        return DeviceKind::Optical;
    }
    if let Some(rest) = name.strip_prefix("nvme") {
        return match split_nvme(rest) {
            Some(false) => DeviceKind::NvmeDisk,
            Some(true) => DeviceKind::NvmePartition,
            None => DeviceKind::Unknown,
        };
    }
    if let Some(rest) = name.strip_prefix("mmcblk") {
        return match split_numbered(rest) {
            Some(_) => DeviceKind::Mmc,
            None => DeviceKind::Unknown,
        };
    }
    if let Some(rest) = name.strip_prefix("sd") {
        let letters = rest.chars().take_while(|c| c.is_ascii_lowercase()).count();
        if letters == 0 {
            return DeviceKind::Unknown;
        }
        let digits = &rest[letters..];
        if digits.is_empty() {
            return DeviceKind::Disk;
        }
        if digits.chars().all(|c| c.is_ascii_digit()) {
            return DeviceKind::Partition;
        }
    }
    DeviceKind::Unknown
}

/// Returns true if the name denotes a partition rather than a whole device.
pub fn is_partition(name: &str) -> bool {
    match classify(name) {
        DeviceKind::Partition | DeviceKind::NvmePartition => true,
        DeviceKind::Mmc => name
            .strip_prefix("mmcblk")
            .and_then(split_numbered)
            .is_some_and(|has_part| has_part),
        _ => false,
    }
}

/// Maps a partition name to its physical disk (`sda1` → `sda`,
/// `nvme0n1p2` → `nvme0n1`, `mmcblk0p1` → `mmcblk0`, `vda1` → `vda`).
///
/// Whole devices map to themselves. Names without a known pattern lose their
/// trailing digits; virtual and optical devices are always whole devices.
pub fn parent_of(name: &str) -> String {
    match classify(name) {
        DeviceKind::NvmePartition | DeviceKind::Mmc if is_partition(name) => name
            .rsplit_once('p')
            .map(|(disk, _)| disk.to_string())
            .unwrap_or_else(|| name.to_string()),
        DeviceKind::Partition | DeviceKind::Unknown => {
            match name.trim_end_matches(|c: char| c.is_ascii_digit()) {
                "" => name.to_string(),
                disk => disk.to_string(),
            }
        }
        _ => name.to_string(),
    }
}

/// Parses `<N>n<M>[p<K>]`; returns whether a partition suffix is present.
fn split_nvme(rest: &str) -> Option<bool> {
    let (_, rest) = take_digits(rest)?;
    let rest = rest.strip_prefix('n')?;
    let (_, rest) = take_digits(rest)?;
    if rest.is_empty() {
        return Some(false);
    }
    let rest = rest.strip_prefix('p')?;
    let (_, rest) = take_digits(rest)?;
    rest.is_empty().then_some(true)
}

/// Parses `<N>[p<K>]`; returns whether a partition suffix is present.
fn split_numbered(rest: &str) -> Option<bool> {
    let (_, rest) = take_digits(rest)?;
    if rest.is_empty() {
        return Some(false);
    }
    let rest = rest.strip_prefix('p')?;
    let (_, rest) = take_digits(rest)?;
    rest.is_empty().then_some(true)
}

/// Splits a non-empty run of leading ASCII digits off `s`.
fn take_digits(s: &str) -> Option<(&str, &str)> {
    let n = s.chars().take_while(|c| c.is_ascii_digit()).count();
    (n > 0).then(|| s.split_at(n))
}
