//! Process probe layer.
//!
//! One probe is one invocation of an external diagnostic or management tool.
//! The runner never turns a non-zero exit code into an error: several tools
//! report meaningful state that way (dirty checks, `lsof` finding nothing),
//! so callers interpret `exit_code` and `stderr` themselves. What the runner
//! does distinguish is a tool that is not installed ([`Error::ProbeUnavailable`])
//! from one that could not be spawned, and from one that ran too long
//! ([`Error::ProbeTimeout`]).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, IoResultExt, Result};
use crate::executor::{ExecutionContext, PKEXEC_CANCELLED, PrivilegeEscalation, WRAPPED_NOT_FOUND};

/// Timeout applied when a request does not set one.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Whether the command needs root (wrapped by the execution context).
    pub privileged: bool,
}

impl ProbeRequest {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            privileged: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a probe that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProbeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into [`Error::ProbeFailed`].
    pub fn into_checked(self, command: &str) -> Result<ProbeOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ProbeFailed {
                command: command.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Seam between the drive engine and the host system.
///
/// Everything the engine learns about the machine flows through this trait:
/// external commands, binary presence and small attribute files under sysfs.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Runs a command to completion (or until its timeout).
    async fn run(&self, request: &ProbeRequest) -> Result<ProbeOutput>;

    /// Returns true if an executable with this name is on `PATH`.
    fn has_binary(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    /// Reads a small text attribute (e.g. `/sys/block/sda/device/model`), trimmed.
    ///
    /// Missing or empty files yield `None`.
    async fn read_attribute(&self, path: &Path) -> Option<String> {
        tokio::fs::read_to_string(path)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Returns true if a filesystem path exists.
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Runs probes as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemProbeRunner {
    ctx: ExecutionContext,
}

impl SystemProbeRunner {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
}

#[async_trait]
impl ProbeRunner for SystemProbeRunner {
    async fn run(&self, request: &ProbeRequest) -> Result<ProbeOutput> {
        let command = request.display();
        let (program, args) =
            self.ctx
                .command_line(&request.program, &request.args, request.privileged);
        let wrapped = request.privileged && self.ctx.is_wrapped();

        tracing::debug!(command = %command, wrapped, "running probe");

        let child = match Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ProbeUnavailable { command: program });
            }
            Err(source) => return Err(Error::ProbeSpawn { command, source }),
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result.command_context(command.clone())?,
            Err(_) => {
                tracing::warn!(command = %command, "probe timed out, killed");
                return Err(Error::ProbeTimeout {
                    command,
                    timeout: request.timeout,
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::trace!(command = %command, exit_code, "probe finished");

        if wrapped {
            if exit_code == WRAPPED_NOT_FOUND {
                return Err(Error::ProbeUnavailable {
                    command: request.program.clone(),
                });
            }
            if exit_code == PKEXEC_CANCELLED
                && self.ctx.escalation() == PrivilegeEscalation::Pkexec
            {
                return Err(Error::AuthenticationCancelled);
            }
        }

        Ok(ProbeOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_display() {
        let req = ProbeRequest::new("lsblk", ["-J", "-b"]);
        assert_eq!(req.display(), "lsblk -J -b");
        assert!(!req.privileged);
        assert_eq!(req.timeout, DEFAULT_PROBE_TIMEOUT);

        let bare = ProbeRequest::new("lsmod", Vec::<String>::new());
        assert_eq!(bare.display(), "lsmod");
    }

    #[test]
    fn test_into_checked() {
        let ok = ProbeOutput {
            stdout: "x".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(ok.into_checked("true").is_ok());

        let failed = ProbeOutput {
            stdout: String::new(),
            stderr: "boom\n".into(),
            exit_code: 2,
        };
        match failed.into_checked("false") {
            Err(Error::ProbeFailed { code, stderr, .. }) => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runner = SystemProbeRunner::default();
        let req = ProbeRequest::new("definitely-not-a-real-tool-4821", ["--version"]);
        let err = runner.run(&req).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runner = SystemProbeRunner::default();
        let req = ProbeRequest::new("sh", ["-c", "echo out; echo err >&2; exit 3"]);
        let output = runner.run(&req).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_timeout_kills_probe() {
        let runner = SystemProbeRunner::default();
        let req = ProbeRequest::new("sleep", ["5"]).timeout(Duration::from_millis(100));
        let err = runner.run(&req).await.unwrap_err();
        assert!(matches!(err, Error::ProbeTimeout { .. }));
    }
}
