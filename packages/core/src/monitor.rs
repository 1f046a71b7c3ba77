//! Hot-plug monitor.
//!
//! Follows `udevadm monitor --subsystem-match=block` and refreshes the
//! inventory when a block device is added or removed. A single physical
//! action produces a burst of kernel events (disk, partitions, partition table
//! re-read), so the first add/remove line opens a settle window and everything
//! arriving inside it is coalesced into one refresh.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::inventory::DriveInventory;
use crate::logging;

/// How long a terminated `udevadm` gets to exit before it is killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Returns true for udev lines announcing a device add or remove.
pub fn is_block_change(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("add") || lower.contains("remove")
}

/// Handle to the background monitoring task.
#[derive(Debug)]
pub struct HotplugMonitor {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl HotplugMonitor {
    /// Spawns `udevadm monitor` and starts watching it.
    pub fn start(inventory: Arc<DriveInventory>, settle_delay: Duration) -> Result<Self> {
        let mut child = match Command::new("udevadm")
            .args(["monitor", "--subsystem-match=block"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ProbeUnavailable {
                    command: "udevadm".to_string(),
                });
            }
            Err(source) => {
                return Err(Error::ProbeSpawn {
                    command: "udevadm monitor --subsystem-match=block".to_string(),
                    source,
                });
            }
        };
        let stdout = child.stdout.take().ok_or_else(|| Error::Generic {
            message: "udevadm stdout was not captured".to_string(),
            source: None,
        })?;
        tracing::info!(settle_ms = settle_delay.as_millis() as u64, "hot-plug monitor started");
        Ok(Self::spawn(inventory, settle_delay, BufReader::new(stdout), Some(child)))
    }

    /// Watches an arbitrary line source; used by [`HotplugMonitor::start`]
    /// and by tests.
    pub fn from_lines<R>(inventory: Arc<DriveInventory>, settle_delay: Duration, reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        Self::spawn(inventory, settle_delay, reader, None)
    }

    fn spawn<R>(
        inventory: Arc<DriveInventory>,
        settle_delay: Duration,
        reader: R,
        child: Option<Child>,
    ) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            watch(inventory, settle_delay, reader, stop_rx).await;
            if let Some(child) = child {
                terminate(child).await;
            }
        });
        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    /// Returns false once the event stream has ended or the task stopped.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops watching and terminates the event-stream process.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.handle.await {
            logging::error(&format!("hot-plug monitor task failed: {e}"));
        }
        tracing::info!("hot-plug monitor stopped");
    }
}

async fn watch<R>(
    inventory: Arc<DriveInventory>,
    settle_delay: Duration,
    reader: R,
    mut stop: oneshot::Receiver<()>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut deadline: Option<Instant> = None;

    loop {
        let settle = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut stop => break,
            _ = settle => {
                deadline = None;
                refresh(&inventory).await;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if is_block_change(&line) && deadline.is_none() {
                        tracing::debug!(line = %line.trim(), "block device change, settling");
                        deadline = Some(Instant::now() + settle_delay);
                    }
                }
                Ok(None) => {
                    if deadline.is_some() {
                        refresh(&inventory).await;
                    }
                    tracing::warn!("device event stream ended");
                    break;
                }
                Err(e) => {
                    logging::error(&format!("failed to read device events: {e}"));
                    break;
                }
            },
        }
    }
}

async fn refresh(inventory: &DriveInventory) {
    match inventory.refresh().await {
        Ok(diff) => tracing::debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "hot-plug refresh done"
        ),
        Err(e) => logging::error(&format!("hot-plug refresh failed: {e}")),
    }
}

/// Sends SIGTERM to the child and reaps it, killing it if it lingers.
async fn terminate(mut child: Child) {
    if let Some(pid) = child.id()
        && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
    {
        tracing::debug!(error = %e, "failed to signal udevadm");
    }
    if tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::events::EventBus;
    use crate::testing::ScriptedRunner;
    use tokio::io::AsyncWriteExt;

    const ONE_DISK: &str = r#"{"blockdevices": [{"name": "sdb", "size": 1, "type": "disk"}]}"#;

    #[test]
    fn test_is_block_change() {
        assert!(is_block_change("KERNEL[1234.5] add      /devices/pci/usb1/block/sdb (block)"));
        assert!(is_block_change("UDEV  [1234.6] REMOVE   /devices/.../sdb1 (block)"));
        assert!(!is_block_change("UDEV  [1234.7] change   /devices/.../sdb (block)"));
        assert!(!is_block_change("monitor will print the received events for:"));
    }

    fn inventory(runner: Arc<ScriptedRunner>) -> Arc<DriveInventory> {
        Arc::new(DriveInventory::new(runner, Arc::new(EventBus::new()), &Settings::default()))
    }

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.with_lsblk(ONE_DISK);
        let (mut writer, reader) = tokio::io::duplex(4096);
        let monitor = HotplugMonitor::from_lines(
            inventory(runner.clone()),
            Duration::from_millis(100),
            BufReader::new(reader),
        );

        writer
            .write_all(b"KERNEL[1.0] add /block/sdb (block)\nKERNEL[1.0] add /block/sdb/sdb1 (block)\nUDEV [1.1] add /block/sdb (block)\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runner.calls_starting_with("lsblk").len(), 1);

        writer.write_all(b"KERNEL[2.0] remove /block/sdb (block)\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runner.calls_starting_with("lsblk").len(), 2);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_change_lines_are_ignored_and_stop_is_clean() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.with_lsblk(ONE_DISK);
        let (mut writer, reader) = tokio::io::duplex(4096);
        let monitor = HotplugMonitor::from_lines(
            inventory(runner.clone()),
            Duration::from_millis(50),
            BufReader::new(reader),
        );

        writer.write_all(b"UDEV [3.0] change /block/sda (block)\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(runner.calls_starting_with("lsblk").is_empty());
        assert!(monitor.is_running());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stream_end_flushes_pending_refresh() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.with_lsblk(ONE_DISK);
        let (mut writer, reader) = tokio::io::duplex(4096);
        let monitor = HotplugMonitor::from_lines(
            inventory(runner.clone()),
            Duration::from_secs(30),
            BufReader::new(reader),
        );

        writer.write_all(b"KERNEL[4.0] add /block/sdc (block)\n").await.unwrap();
        drop(writer);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.calls_starting_with("lsblk").len(), 1);
        assert!(!monitor.is_running());
        monitor.stop().await;
    }
}
