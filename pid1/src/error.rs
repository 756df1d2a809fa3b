use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    #[error("no child processes left to wait for")]
    NoChildren,

    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("wait: {0}")]
    Wait(nix::errno::Errno),

    #[error("signal {signal} to {pid}: {source}")]
    Signal {
        pid: Pid,
        signal: nix::sys::signal::Signal,
        source: nix::errno::Errno,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProcessResult<T> = Result<T, ProcessError>;
