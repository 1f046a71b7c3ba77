//! NTFS driver detection.
//!
//! Three implementations can mount NTFS on Linux. In order of preference: the
//! in-kernel `ntfs3` driver (usable from kernel 5.15), the low-level FUSE
//! driver `lowntfs-3g` and the classic FUSE driver `ntfs-3g`.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::parse;
use crate::probe::{ProbeRequest, ProbeRunner};

/// First kernel with a usable `ntfs3` driver.
pub const MIN_NTFS3_KERNEL: (u32, u32) = (5, 15);

/// An NTFS mount implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NtfsDriver {
    #[serde(rename = "ntfs3")]
    Ntfs3,
    #[serde(rename = "lowntfs-3g")]
    LowNtfs3g,
    #[serde(rename = "ntfs-3g")]
    Ntfs3g,
    #[serde(rename = "unknown")]
    Unknown,
}

/// The fixed preference cycle the fallback chain walks.
pub const DRIVER_CYCLE: [NtfsDriver; 3] =
    [NtfsDriver::Ntfs3, NtfsDriver::LowNtfs3g, NtfsDriver::Ntfs3g];

impl NtfsDriver {
    /// Filesystem type passed to the mount tool.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ntfs3 => "ntfs3",
            Self::LowNtfs3g => "lowntfs-3g",
            Self::Ntfs3g => "ntfs-3g",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Drivers to try after `self` failed, in preference order.
    pub fn fallback_order(&self) -> Vec<NtfsDriver> {
        DRIVER_CYCLE.into_iter().filter(|d| d != self).collect()
    }
}

impl std::fmt::Display for NtfsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Returns true if the `ntfs3` module is loaded or installed.
async fn ntfs3_module_present(runner: &dyn ProbeRunner) -> bool {
    let lsmod = ProbeRequest::new("lsmod", Vec::<String>::new());
    if let Ok(output) = runner.run(&lsmod).await
        && parse::lsmod_has_module(&output.stdout, "ntfs3")
    {
        return true;
    }
    let modinfo = ProbeRequest::new("modinfo", ["ntfs3"]);
    matches!(runner.run(&modinfo).await, Ok(output) if output.success())
}

async fn kernel_supports_ntfs3(runner: &dyn ProbeRunner) -> bool {
    let uname = ProbeRequest::new("uname", ["-r"]);
    match runner.run(&uname).await {
        Ok(output) => parse::kernel_version(&output.stdout)
            .is_some_and(|version| version >= MIN_NTFS3_KERNEL),
        Err(_) => false,
    }
}

/// Checks whether one driver can be used on this host.
pub async fn is_available(runner: &dyn ProbeRunner, driver: NtfsDriver) -> bool {
    match driver {
        NtfsDriver::Ntfs3 => ntfs3_module_present(runner).await,
        NtfsDriver::LowNtfs3g | NtfsDriver::Ntfs3g => runner.has_binary(driver.name()),
        NtfsDriver::Unknown => false,
    }
}

/// Picks the best driver available on this host.
pub async fn detect(runner: &dyn ProbeRunner) -> NtfsDriver {
    if ntfs3_module_present(runner).await {
        if kernel_supports_ntfs3(runner).await {
            return NtfsDriver::Ntfs3;
        }
        tracing::debug!("ntfs3 module present but kernel is older than 5.15");
    }
    if runner.has_binary(NtfsDriver::LowNtfs3g.name()) {
        return NtfsDriver::LowNtfs3g;
    }
    if runner.has_binary(NtfsDriver::Ntfs3g.name()) {
        return NtfsDriver::Ntfs3g;
    }
    NtfsDriver::Unknown
}

/// Memoized detection result with explicit invalidation.
#[derive(Debug, Default)]
pub struct DriverCache {
    detected: Mutex<Option<NtfsDriver>>,
}

impl DriverCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached driver, detecting it on first use.
    pub async fn get(&self, runner: &dyn ProbeRunner) -> NtfsDriver {
        if let Some(driver) = self.cached() {
            return driver;
        }
        let driver = detect(runner).await;
        tracing::info!(driver = %driver, "detected NTFS driver");
        *self.detected.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);
        driver
    }

    pub fn cached(&self) -> Option<NtfsDriver> {
        *self.detected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forgets the cached result; the next [`DriverCache::get`] re-detects.
    pub fn invalidate(&self) {
        *self.detected.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    const LSMOD_NTFS3: &str = "Module                  Size  Used by\nntfs3                 180224  0\n";

    #[test]
    fn test_fallback_order() {
        assert_eq!(
            NtfsDriver::Ntfs3.fallback_order(),
            vec![NtfsDriver::LowNtfs3g, NtfsDriver::Ntfs3g]
        );
        assert_eq!(
            NtfsDriver::LowNtfs3g.fallback_order(),
            vec![NtfsDriver::Ntfs3, NtfsDriver::Ntfs3g]
        );
        assert_eq!(NtfsDriver::Unknown.fallback_order(), DRIVER_CYCLE.to_vec());
    }

    #[tokio::test]
    async fn test_detect_ntfs3_on_new_kernel() {
        let runner = ScriptedRunner::new();
        runner.ok("lsmod", LSMOD_NTFS3);
        runner.ok("uname -r", "6.8.0-45-generic\n");
        runner.with_binary("ntfs-3g");
        assert_eq!(detect(&runner).await, NtfsDriver::Ntfs3);
    }

    #[tokio::test]
    async fn test_detect_rejects_old_kernel() {
        let runner = ScriptedRunner::new();
        runner.ok("lsmod", LSMOD_NTFS3);
        runner.ok("uname -r", "5.10.0-28-amd64\n");
        runner.with_binary("lowntfs-3g").with_binary("ntfs-3g");
        assert_eq!(detect(&runner).await, NtfsDriver::LowNtfs3g);
    }

    #[tokio::test]
    async fn test_detect_modinfo_and_binaries() {
        let runner = ScriptedRunner::new();
        runner.ok("lsmod", "Module Size Used by\n");
        runner.ok("modinfo ntfs3", "filename: /lib/modules/ntfs3.ko\n");
        runner.ok("uname -r", "6.1.0\n");
        assert_eq!(detect(&runner).await, NtfsDriver::Ntfs3);

        let none = ScriptedRunner::new();
        assert_eq!(detect(&none).await, NtfsDriver::Unknown);

        let fuse = ScriptedRunner::new();
        fuse.with_binary("ntfs-3g");
        assert_eq!(detect(&fuse).await, NtfsDriver::Ntfs3g);
    }

    #[tokio::test]
    async fn test_cache_memoizes_until_invalidated() {
        let runner = ScriptedRunner::new();
        runner.with_binary("ntfs-3g");
        let cache = DriverCache::new();

        assert_eq!(cache.get(&runner).await, NtfsDriver::Ntfs3g);
        let probes = runner.calls().len();
        assert_eq!(cache.get(&runner).await, NtfsDriver::Ntfs3g);
        assert_eq!(runner.calls().len(), probes);

        cache.invalidate();
        assert_eq!(cache.cached(), None);
        cache.get(&runner).await;
        assert!(runner.calls().len() > probes);
    }
}
