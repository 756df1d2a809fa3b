use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with the given code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// Numeric exit code, using the shell convention `128 + signo` for
    /// signal deaths.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig as i32,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Extract a terminal status from a raw wait result.
    ///
    /// Stop/continue/ptrace notifications are not terminations and yield `None`.
    pub(crate) fn from_wait_status(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Self::Exited(code))),
            WaitStatus::Signaled(pid, sig, _) => Some((pid, Self::Signaled(sig))),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(sig) => write!(f, "killed by {sig}"),
        }
    }
}
