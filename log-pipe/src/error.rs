use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LogPipeError {
    #[error("create log pipe {path}: {source}")]
    CreatePipe {
        path: PathBuf,
        source: nix::errno::Errno,
    },

    #[error("{0} exists and is not a named pipe")]
    NotAPipe(PathBuf),

    #[error(
        "the logging pipe {0} does not exist; chef-init must be running and own it before services log"
    )]
    MissingPipe(PathBuf),

    #[error("open log pipe {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LogPipeResult<T> = Result<T, LogPipeError>;
