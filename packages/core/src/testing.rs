//! Scripted probe runner for tests and dry runs.
//!
//! [`ScriptedRunner`] answers probes from a table keyed by the full command
//! line (`program arg1 arg2 ...`). Anything not scripted behaves like a tool
//! that is not installed, which is also how the engine treats missing
//! diagnostics on a real host. Every invocation is recorded so tests can
//! assert on what ran and in which order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::disk::LSBLK_COLUMNS;
use crate::error::{Error, Result};
use crate::probe::{ProbeOutput, ProbeRequest, ProbeRunner};

/// Canned answer for one command line.
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(ProbeOutput),
    Unavailable,
    Timeout,
}

#[derive(Debug, Default)]
struct State {
    responses: HashMap<String, VecDeque<Scripted>>,
    binaries: HashSet<String>,
    attributes: HashMap<PathBuf, String>,
    paths: HashSet<PathBuf>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

/// In-memory [`ProbeRunner`] driven by a script.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    state: Mutex<State>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a response for a command line.
    ///
    /// Responses queued for the same command line are returned in order; the
    /// last one keeps answering once the queue is down to a single entry.
    pub fn respond(&self, command_line: &str, response: Scripted) -> &Self {
        self.state()
            .responses
            .entry(command_line.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Scripts a completed run.
    pub fn on(&self, command_line: &str, stdout: &str, stderr: &str, exit_code: i32) -> &Self {
        self.respond(
            command_line,
            Scripted::Output(ProbeOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            }),
        )
    }

    /// Scripts a successful run with the given stdout.
    pub fn ok(&self, command_line: &str, stdout: &str) -> &Self {
        self.on(command_line, stdout, "", 0)
    }

    /// Scripts the device enumeration with lsblk JSON output.
    pub fn with_lsblk(&self, json: &str) -> &Self {
        self.ok(&format!("lsblk -J -b -o {LSBLK_COLUMNS}"), json)
    }

    /// Replaces the scripted lsblk output (e.g. after a simulated unplug).
    pub fn replace_lsblk(&self, json: &str) -> &Self {
        self.forget(&format!("lsblk -J -b -o {LSBLK_COLUMNS}"));
        self.with_lsblk(json)
    }

    /// Drops every queued response for a command line.
    pub fn forget(&self, command_line: &str) -> &Self {
        self.state().responses.remove(command_line);
        self
    }

    /// Makes every run of a command line take `delay` before answering.
    pub fn with_delay(&self, command_line: &str, delay: Duration) -> &Self {
        self.state().delays.insert(command_line.to_string(), delay);
        self
    }

    pub fn with_binary(&self, name: &str) -> &Self {
        self.state().binaries.insert(name.to_string());
        self
    }

    pub fn with_attribute(&self, path: impl Into<PathBuf>, value: &str) -> &Self {
        self.state().attributes.insert(path.into(), value.to_string());
        self
    }

    pub fn with_path(&self, path: impl Into<PathBuf>) -> &Self {
        self.state().paths.insert(path.into());
        self
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Command lines that start with `prefix`, in order.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl ProbeRunner for ScriptedRunner {
    async fn run(&self, request: &ProbeRequest) -> Result<ProbeOutput> {
        let command = request.display();
        let (scripted, delay) = {
            let mut state = self.state();
            state.calls.push(command.clone());
            let delay = state.delays.get(&command).copied();
            let scripted = match state.responses.get_mut(&command) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            (scripted, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Timeout) => Err(Error::ProbeTimeout {
                command,
                timeout: Duration::from_secs(0),
            }),
            Some(Scripted::Unavailable) | None => Err(Error::ProbeUnavailable {
                command: request.program.clone(),
            }),
        }
    }

    fn has_binary(&self, name: &str) -> bool {
        self.state().binaries.contains(name)
    }

    async fn read_attribute(&self, path: &Path) -> Option<String> {
        self.state().attributes.get(path).cloned()
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.paths.contains(path) || state.attributes.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_responses_then_sticky() {
        let runner = ScriptedRunner::new();
        runner.on("udisksctl mount -b /dev/sdb1", "", "busy", 1);
        runner.ok("udisksctl mount -b /dev/sdb1", "Mounted /dev/sdb1 at /media/x.");

        let req = ProbeRequest::new("udisksctl", ["mount", "-b", "/dev/sdb1"]);
        assert_eq!(runner.run(&req).await.unwrap().exit_code, 1);
        assert_eq!(runner.run(&req).await.unwrap().exit_code, 0);
        assert_eq!(runner.run(&req).await.unwrap().exit_code, 0);
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_is_unavailable() {
        let runner = ScriptedRunner::new();
        let err = runner
            .run(&ProbeRequest::new("smartctl", ["-H", "/dev/sda"]))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(runner.calls_starting_with("smartctl"), vec!["smartctl -H /dev/sda"]);
    }
}
