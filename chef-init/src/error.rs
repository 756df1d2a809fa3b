use log_pipe::LogPipeError;
use pid1::{ExitStatus, ProcessError};
use service_dir::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// Bad flags or missing configuration. Reported before any child exists.
    #[error("{0}")]
    Usage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("supervisor exited during startup ({0})")]
    SupervisorExited(ExitStatus),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("log pipe error: {0}")]
    LogPipe(#[from] LogPipeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InitError {
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_) | Self::Config(_))
    }

    /// The line printed to stderr before exiting. Usage mistakes point at
    /// `--help`; anything later has already been logged with its context.
    pub fn diagnostic(&self) -> String {
        if self.is_usage() {
            format!("error: {self}\nTry 'chef-init --help' for more information.")
        } else {
            format!("error: {self}")
        }
    }
}

pub type InitResult<T> = Result<T, InitError>;
