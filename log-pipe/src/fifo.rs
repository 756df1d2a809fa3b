use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::error::{LogPipeError, LogPipeResult};

/// Create the FIFO at `path`. An existing FIFO is reused; any other file
/// type at that path is an error.
pub fn create_pipe(path: &Path) -> LogPipeResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            debug!(path = %path.display(), "reusing existing log pipe");
            return Ok(());
        }
        Ok(_) => return Err(LogPipeError::NotAPipe(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(LogPipeError::Io(e)),
    }

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)).map_err(|source| {
        LogPipeError::CreatePipe {
            path: path.to_path_buf(),
            source,
        }
    })?;
    debug!(path = %path.display(), "created log pipe");
    Ok(())
}

/// Remove the FIFO. A pipe that is already gone is not an error.
pub fn remove_pipe(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed log pipe"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove log pipe"),
    }
}

/// Whether `path` currently is a FIFO.
pub(crate) fn is_pipe(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}
