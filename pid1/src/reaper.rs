use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::error::{ProcessError, ProcessResult};
use crate::registry::{Shared, Table};
use crate::status::ExitStatus;

/// Poll interval for bounded waits.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collects exit statuses for a [`ProcessRegistry`](crate::ProcessRegistry).
///
/// At most one caller is inside the blocking wait-any at a time. That caller
/// files every status it observes into the pending table and wakes the
/// others, who either find their own pid there or take over the wait.
#[derive(Debug, Clone)]
pub struct Reaper {
    shared: Arc<Shared>,
}

impl Reaper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Block until `pid` exits and return its status, reaping every other
    /// child that exits in the meantime.
    ///
    /// Fails with [`ProcessError::ProcessNotFound`] if `pid` is not
    /// registered (never spawned, or already collected) and with
    /// [`ProcessError::NoChildren`] if the kernel reports nothing left to
    /// wait for.
    pub fn wait_for(&self, pid: Pid) -> ProcessResult<ExitStatus> {
        let mut table = self.shared.lock();
        loop {
            if let Some(status) = table.take(pid) {
                return Ok(status);
            }
            if !table.processes.contains_key(&pid) {
                return Err(ProcessError::ProcessNotFound(pid));
            }
            if table.waiting {
                table = self.shared.wait(table);
                continue;
            }

            table.waiting = true;
            drop(table);
            let observed = wait_any();
            table = self.shared.lock();
            table.waiting = false;
            self.shared.observed.notify_all();

            match observed {
                Ok(Some((seen, status))) => table.record(seen, status),
                Ok(None) => {}
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // Statuses may have been filed by an earlier leader.
                    if let Some(status) = table.take(pid) {
                        return Ok(status);
                    }
                    return Err(ProcessError::NoChildren);
                }
                Err(e) => return Err(ProcessError::Wait(e)),
            }
        }
    }

    /// Async form of [`wait_for`](Self::wait_for), run on the blocking pool.
    pub async fn wait(&self, pid: Pid) -> ProcessResult<ExitStatus> {
        let reaper = self.clone();
        tokio::task::spawn_blocking(move || reaper.wait_for(pid))
            .await
            .map_err(|e| ProcessError::Io(std::io::Error::other(e)))?
    }

    /// Non-blocking check for `pid`: drains every already-exited child and
    /// returns `pid`'s status if it was among them.
    pub fn try_wait_for(&self, pid: Pid) -> ProcessResult<Option<ExitStatus>> {
        let mut table = self.shared.lock();
        if let Some(status) = table.take(pid) {
            return Ok(Some(status));
        }
        if !table.processes.contains_key(&pid) {
            return Err(ProcessError::ProcessNotFound(pid));
        }
        if table.waiting {
            // The blocking leader files it as soon as it exits.
            return Ok(None);
        }

        let drained = drain(&mut table)?;
        self.shared.observed.notify_all();
        match table.take(pid) {
            Some(status) => Ok(Some(status)),
            None if drained.no_children => Err(ProcessError::NoChildren),
            None => Ok(None),
        }
    }

    /// Wait for `pid` for at most `timeout`. `Ok(None)` means it is still running.
    pub async fn wait_timeout(
        &self,
        pid: Pid,
        timeout: Duration,
    ) -> ProcessResult<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait_for(pid)? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Reap every child that has already exited, without blocking.
    ///
    /// Registered children are kept for their owners; orphans are discarded.
    /// Returns how many children were reaped.
    pub fn reap_available(&self) -> usize {
        let mut table = self.shared.lock();
        if table.waiting {
            return 0;
        }
        let reaped = match drain(&mut table) {
            Ok(drained) => drained.reaped,
            Err(e) => {
                debug!(error = %e, "reap failed");
                0
            }
        };
        if reaped > 0 {
            self.shared.observed.notify_all();
        }
        reaped
    }

    /// Exit statuses observed but not yet collected.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

struct Drained {
    reaped: usize,
    no_children: bool,
}

/// Collect all exited children with `WNOHANG`. Caller holds the table lock.
fn drain(table: &mut Table) -> ProcessResult<Drained> {
    let mut drained = Drained {
        reaped: 0,
        no_children: false,
    };
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, exit)) = ExitStatus::from_wait_status(status) {
                    trace!(pid = %pid, status = %exit, "reaped");
                    table.record(pid, exit);
                    drained.reaped += 1;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                drained.no_children = true;
                break;
            }
            Err(e) => return Err(ProcessError::Wait(e)),
        }
    }
    Ok(drained)
}

/// One blocking wait-any.
fn wait_any() -> Result<Option<(Pid, ExitStatus)>, Errno> {
    let status = waitpid(Pid::from_raw(-1), None)?;
    let exit = ExitStatus::from_wait_status(status);
    if let Some((pid, status)) = exit {
        trace!(pid = %pid, status = %status, "reaped");
    }
    Ok(exit)
}
