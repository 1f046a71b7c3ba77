//! ntfs-manager-core: drive inventory and NTFS mounting engine.
//!
//! The library enumerates block devices, keeps an in-memory inventory of
//! drive records, mounts NTFS volumes through a driver fallback chain with
//! dirty-volume handling, and follows udev hot-plug events.
//!
//! # Modules
//!
//! - [`classify`]: Device-name classification and exclusion rules
//! - [`disk`]: Block device enumeration using `lsblk`
//! - [`inventory`]: Drive record snapshot, refresh and diffing
//! - [`ntfs`]: NTFS mount state machine with driver fallback
//! - [`operations`]: Generic mount, unmount, format, repair and eject
//! - [`properties`]: NTFS volume info, SMART attributes and disk checks
//! - [`monitor`]: Debounced udev hot-plug monitoring
//! - [`manager`]: The [`DriveManager`] context tying everything together
//! - [`events`]: Drive lifecycle events and subscribers
//! - [`config`]: Settings file and per-driver mount options
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use ntfs_manager_core::{DriveManager, Settings};
//!
//! # async fn run() -> ntfs_manager_core::Result<()> {
//! let manager = DriveManager::new(Settings::load_default()?);
//! manager.refresh().await?;
//!
//! for drive in manager.list_all() {
//!     if drive.is_ntfs() && !drive.is_mounted() {
//!         let outcome = manager.mount(&drive.name, None, None).await?;
//!         println!("{}: {:?}", drive.name, outcome.status);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod disk;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod ntfs;
pub mod operations;
pub mod parse;
pub mod probe;
pub mod properties;
pub mod record;
pub mod testing;

// Re-export commonly used types
pub use config::Settings;
pub use driver::NtfsDriver;
pub use error::{Error, Result};
pub use events::{DriveEvent, EventBus, EventKind, EventSubscriber};
pub use inventory::DiffResult;
pub use manager::DriveManager;
pub use ntfs::{MountOutcome, MountStatus};
pub use record::{DriveRecord, DriveStatus, HealthStatus};
