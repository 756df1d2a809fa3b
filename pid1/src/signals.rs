//! PID 1 signal dispositions and signal delivery.
//!
//! Follows the [tini](https://github.com/krallin/tini) conventions: job-control
//! signals that would stop PID 1 on TTY access are ignored, `SIGPIPE` is
//! ignored so a vanished log reader cannot kill us, and `SIGCHLD` stays at
//! its default so wait-any keeps working. Termination signals are handled by
//! the async runtime, not here.

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, killpg, sigaction};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{ProcessError, ProcessResult};

/// Ignore `SIGTTIN`, `SIGTTOU` and `SIGPIPE`.
///
/// `SIGCHLD` must NOT be set to `SIG_IGN`: the kernel would then auto-reap
/// children and every wait would fail with `ECHILD`.
pub fn setup_signal_dispositions() {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());
    for sig in [Signal::SIGTTIN, Signal::SIGTTOU, Signal::SIGPIPE] {
        // SAFETY: installing SIG_IGN runs no user code in signal context.
        if let Err(e) = unsafe { sigaction(sig, &ignore) } {
            warn!(signal = %sig, error = %e, "failed to ignore signal");
        }
    }
}

/// Whether this process is the init process of its PID namespace.
pub fn is_pid1() -> bool {
    nix::unistd::getpid() == Pid::from_raw(1)
}

/// Mark this process as a child subreaper, so orphaned descendants are
/// reparented to it even when it is not PID 1.
pub fn become_subreaper() -> ProcessResult<()> {
    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| ProcessError::Io(std::io::Error::from(e)))
}

/// Deliver `signal` to `pid`. Returns `Ok(false)` if the process is already gone.
pub fn send_signal(pid: Pid, signal: Signal) -> ProcessResult<bool> {
    match kill(pid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => {
            debug!(pid = %pid, signal = %signal, "process already gone");
            Ok(false)
        }
        Err(source) => Err(ProcessError::Signal { pid, signal, source }),
    }
}

/// Deliver `signal` to the whole process group led by `pgid`.
///
/// Requires the leader to have been spawned with
/// [`CommandSpec::process_group`](crate::CommandSpec::process_group).
/// Returns `Ok(false)` if the group no longer exists.
pub fn signal_group(pgid: Pid, signal: Signal) -> ProcessResult<bool> {
    match killpg(pgid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => {
            debug!(pgid = %pgid, signal = %signal, "process group already gone");
            Ok(false)
        }
        Err(source) => Err(ProcessError::Signal {
            pid: pgid,
            signal,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::{CommandSpec, ExitStatus, ProcessRegistry, Role};

    #[test]
    fn test_process_is_not_pid1() {
        assert!(!is_pid1());
    }

    #[test]
    fn dispositions_can_be_installed_twice() {
        setup_signal_dispositions();
        setup_signal_dispositions();
    }

    #[test]
    #[serial]
    fn send_signal_to_exited_process_is_not_an_error() {
        let registry = ProcessRegistry::new();
        let child = registry
            .spawn(&CommandSpec::new("true"), Role::Helper)
            .unwrap();
        registry.reaper().wait_for(child.pid).unwrap();

        assert!(!send_signal(child.pid, Signal::SIGTERM).unwrap());
    }

    #[test]
    #[serial]
    fn signal_group_reaches_group_leader() {
        let registry = ProcessRegistry::new();
        let child = registry
            .spawn(
                &CommandSpec::new("sleep").arg("30").process_group(true),
                Role::Supervisor,
            )
            .unwrap();

        assert!(signal_group(child.pid, Signal::SIGKILL).unwrap());
        let status = registry.reaper().wait_for(child.pid).unwrap();
        assert_eq!(status, ExitStatus::Signaled(Signal::SIGKILL));
    }
}
