//! Privilege escalation for commands that must run as root.
//!
//! Formatting, repairing and direct mounting need root, while the volume
//! manager (`udisksctl`) negotiates with polkit on its own. This module decides
//! how a privileged command line is wrapped: directly, via `pkexec` (GUI) or
//! via `sudo` (TTY).

use serde::{Deserialize, Serialize};

/// Exit code `pkexec` uses when the user dismisses the authentication dialog.
pub const PKEXEC_CANCELLED: i32 = 126;

/// Exit code both wrappers use when the wrapped program does not exist.
pub const WRAPPED_NOT_FOUND: i32 = 127;

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    /// Name of the wrapper binary, if any.
    pub fn wrapper(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// Execution context for running privileged system commands.
///
/// # Example
///
/// ```
/// use ntfs_manager_core::executor::ExecutionContext;
///
/// let ctx = ExecutionContext::with_pkexec();
/// let (program, args) = ctx.command_line("ntfsfix", &["-d".to_string()], true);
/// assert_eq!(program, "pkexec");
/// assert_eq!(args, vec!["ntfsfix".to_string(), "-d".to_string()]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
}

impl ExecutionContext {
    /// Creates a new execution context with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution context that uses `pkexec` for privileged commands.
    pub fn with_pkexec() -> Self {
        Self {
            escalation: PrivilegeEscalation::Pkexec,
        }
    }

    /// Creates an execution context that uses `sudo` for privileged commands.
    pub fn with_sudo() -> Self {
        Self {
            escalation: PrivilegeEscalation::Sudo,
        }
    }

    /// Creates an execution context with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Returns true when privileged commands go through a wrapper.
    pub fn is_wrapped(&self) -> bool {
        self.escalation.wrapper().is_some()
    }

    /// Builds the actual program and argument list for a command.
    ///
    /// Unprivileged commands are never wrapped.
    pub fn command_line(
        &self,
        program: &str,
        args: &[String],
        privileged: bool,
    ) -> (String, Vec<String>) {
        match self.escalation.wrapper() {
            Some(wrapper) if privileged => {
                let mut wrapped = Vec::with_capacity(args.len() + 1);
                wrapped.push(program.to_string());
                wrapped.extend(args.iter().cloned());
                (wrapper.to_string(), wrapped)
            }
            _ => (program.to_string(), args.to_vec()),
        }
    }
}
