use std::path::PathBuf;
use std::time::Duration;

use pid1::{ExitStatus, ProcessError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid service name `{0}`")]
    InvalidName(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("sv {action} {service} failed ({status}): {stderr}")]
    Control {
        action: &'static str,
        service: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("service {service} was not picked up by runsvdir within {waited:?}")]
    NotSupervised { service: String, waited: Duration },

    #[error("invalid container_service attributes: {0}")]
    Attributes(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl ServiceError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
