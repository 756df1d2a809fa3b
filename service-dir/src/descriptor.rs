use std::fmt;
use std::path::Path;

use init_common::layout::LOGGER_BIN;
use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};

/// Where a service's output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Through `chef-init-logger` into the shared log pipe, then stdout.
    #[default]
    Stream,
    /// Into `svlogd`-managed files under `<file log root>/<name>`.
    File,
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::File => write!(f, "file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub command: String,
    pub log_mode: LogMode,
}

impl ServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        log_mode: LogMode,
    ) -> ServiceResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            command: command.into(),
            log_mode,
        })
    }

    pub fn run_script(&self) -> String {
        format!("#!/bin/sh\nexec 2>&1\nexec {} 2>&1\n", self.command)
    }

    /// `file_log_root` is only consulted in [`LogMode::File`].
    pub fn log_run_script(&self, file_log_root: &Path) -> String {
        match self.log_mode {
            LogMode::Stream => format!(
                "#!/bin/sh\nexec {LOGGER_BIN} --service-name {}\n",
                self.name
            ),
            LogMode::File => format!(
                "#!/bin/sh\nexec svlogd -tt {}\n",
                file_log_root.join(&self.name).display()
            ),
        }
    }
}

/// Service names become directory names and shell words.
pub(crate) fn validate_name(name: &str) -> ServiceResult<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if ok {
        Ok(())
    } else {
        Err(ServiceError::InvalidName(name.to_string()))
    }
}
