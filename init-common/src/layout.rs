//! Omnibus install layout.
//!
//! Everything chef-init runs or writes lives under one install root
//! (`/opt/chef` by default):
//!
//! ```text
//! /opt/chef/bin            user-facing binaries (chef-client, chef-init)
//! /opt/chef/embedded/bin   runsvdir, sv, svlogd
//! /opt/chef/sv/<name>      service staging directories
//! /opt/chef/service/<name> activation symlinks watched by runsvdir
//! /opt/chef/logs           log pipe (FIFO)
//! ```

use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/opt/chef";

/// Standard system directories appended after the omnibus bin directories.
pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Name of the per-service log writer binary.
pub const LOGGER_BIN: &str = "chef-init-logger";

/// Environment variable that overrides the log pipe location for writers.
pub const LOG_PIPE_ENV: &str = "CHEF_INIT_LOG_PIPE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn embedded_bin_dir(&self) -> PathBuf {
        self.root.join("embedded").join("bin")
    }

    /// Where service directories are staged before activation.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("sv")
    }

    /// The directory runsvdir watches; one symlink per active service.
    pub fn service_dir(&self) -> PathBuf {
        self.root.join("service")
    }

    pub fn log_pipe(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn runsvdir_bin(&self) -> PathBuf {
        self.embedded_bin_dir().join("runsvdir")
    }

    pub fn sv_bin(&self) -> PathBuf {
        self.embedded_bin_dir().join("sv")
    }

    /// `PATH` handed to every child: omnibus bins first, then the system dirs.
    pub fn search_path(&self) -> String {
        format!(
            "{}:{}:{SYSTEM_PATH}",
            self.bin_dir().display(),
            self.embedded_bin_dir().display()
        )
    }
}
