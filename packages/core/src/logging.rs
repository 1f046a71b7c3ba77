//! Logging collaborator for operations and drive events.
//!
//! Thin wrappers over `tracing` with fixed targets so a subscriber can route
//! operation reports, lifecycle events and errors separately. None of these
//! functions block or fail.

use crate::events::EventKind;
use crate::record::DriveRecord;

pub const OPERATIONS_TARGET: &str = "ntfs_manager::operations";
pub const EVENTS_TARGET: &str = "ntfs_manager::events";
pub const ERRORS_TARGET: &str = "ntfs_manager::errors";

/// Outcome of a user-visible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Records an operation (`mount`, `format`, ...) on a device.
pub fn operation(op: &str, device: &str, status: OperationStatus, details: &str) {
    match status {
        OperationStatus::Failed => tracing::warn!(
            target: OPERATIONS_TARGET,
            op,
            device,
            status = status.as_str(),
            details,
            "operation failed"
        ),
        _ => tracing::info!(
            target: OPERATIONS_TARGET,
            op,
            device,
            status = status.as_str(),
            details,
            "operation {}",
            status.as_str()
        ),
    }
}

/// Records a lifecycle event for a drive.
pub fn drive_event(kind: EventKind, record: &DriveRecord) {
    match kind {
        EventKind::DirtyVolume => tracing::warn!(
            target: EVENTS_TARGET,
            event = kind.as_str(),
            device = %record.name,
            fstype = %record.filesystem_type,
            "dirty volume detected"
        ),
        _ => tracing::info!(
            target: EVENTS_TARGET,
            event = kind.as_str(),
            device = %record.name,
            fstype = %record.filesystem_type,
            mount_point = %record.mount_point,
            "drive {}",
            kind
        ),
    }
}

/// Records an error that was handled but should be visible.
pub fn error(msg: &str) {
    tracing::error!(target: ERRORS_TARGET, "{msg}");
}
