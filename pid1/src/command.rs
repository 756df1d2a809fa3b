use std::io::Read;

use tracing::trace;

use crate::error::{ProcessError, ProcessResult};
use crate::registry::{CommandSpec, ProcessRegistry, Role};
use crate::status::ExitStatus;

/// Captured result of a short-lived command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run a helper command to completion and capture its output.
///
/// The child is spawned through `registry` and collected through its
/// reaper like every other child. A non-zero exit is not an error here;
/// callers inspect `status`.
pub async fn exec(registry: &ProcessRegistry, spec: CommandSpec) -> ProcessResult<Output> {
    trace!(command = %spec.display(), "exec");
    let registry = registry.clone();
    tokio::task::spawn_blocking(move || exec_blocking(&registry, &spec))
        .await
        .map_err(|e| ProcessError::Io(std::io::Error::other(e)))?
}

fn exec_blocking(registry: &ProcessRegistry, spec: &CommandSpec) -> ProcessResult<Output> {
    let spec = spec.clone().capture_output();
    let mut child = registry.spawn(&spec, Role::Helper)?;

    // Drain stderr on its own thread so a full pipe cannot wedge the child.
    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        })
    });
    let mut stdout = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout);
    }
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    let status = registry.reaper().wait_for(child.pid)?;
    Ok(Output {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Run a helper command, logging instead of returning any failure.
pub async fn exec_ignore_errors(registry: &ProcessRegistry, spec: CommandSpec) {
    let cmd_display = spec.display();
    trace!(command = %cmd_display, "exec_ignore_errors");

    match exec(registry, spec).await {
        Ok(o) if !o.status.success() => {
            trace!(command = %cmd_display, status = %o.status, stderr = %o.stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}
