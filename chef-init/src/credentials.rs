//! Removal of bootstrap secrets from the running container.
//!
//! All deletions are idempotent: a file that is already gone is not an error.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const VALIDATION_KEY_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub secure_dir: PathBuf,
    pub validation_key: PathBuf,
    pub client_key: PathBuf,
    pub node_name_file: PathBuf,
}

impl Credentials {
    /// Keys at their default names inside `secure_dir`.
    pub fn in_secure_dir(secure_dir: impl Into<PathBuf>, node_name_file: impl Into<PathBuf>) -> Self {
        let secure_dir = secure_dir.into();
        Self {
            validation_key: secure_dir.join("validation.pem"),
            client_key: secure_dir.join("client.pem"),
            secure_dir,
            node_name_file: node_name_file.into(),
        }
    }

    /// Delete the validation key, but only once the client key exists: the
    /// validation key is what registers the node, so it has to stay until
    /// registration produced a client key. Returns whether it was deleted.
    pub fn delete_validation_key(&self) -> io::Result<bool> {
        if !self.client_key.exists() {
            return Ok(false);
        }
        remove_if_exists(&self.validation_key)
    }

    pub fn delete_client_key(&self) -> io::Result<bool> {
        remove_if_exists(&self.client_key)
    }

    pub fn delete_node_name_file(&self) -> io::Result<bool> {
        remove_if_exists(&self.node_name_file)
    }

    /// Remove everything inside the secure directory, keeping the directory.
    pub fn empty_secure_directory(&self) -> io::Result<()> {
        let entries = match std::fs::read_dir(&self.secure_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Post-bootstrap cleanup: client key, node name marker and, when
    /// `remove_secure` is set, the secure directory's contents. Failures are
    /// logged; every step runs.
    pub fn clean(&self, remove_secure: bool) {
        info!("deleting client key");
        log_failure("delete client key", self.delete_client_key());
        debug!("removing node name file");
        log_failure("delete node name file", self.delete_node_name_file());
        if remove_secure {
            info!(path = %self.secure_dir.display(), "emptying secure directory");
            log_failure("empty secure directory", self.empty_secure_directory());
        }
    }

    /// Poll until the client key appears, then delete the validation key.
    ///
    /// Runs until it succeeds or the returned handle is aborted.
    pub fn spawn_validation_key_cleanup(&self) -> JoinHandle<()> {
        let credentials = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(VALIDATION_KEY_POLL);
            loop {
                interval.tick().await;
                match credentials.delete_validation_key() {
                    Ok(_) if credentials.client_key.exists() => {
                        info!("validation key removed");
                        return;
                    }
                    Ok(_) => debug!("client key not present yet"),
                    Err(e) => {
                        warn!(path = %credentials.validation_key.display(), error = %e, "failed to delete validation key");
                        return;
                    }
                }
            }
        })
    }
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn log_failure<T>(what: &str, result: io::Result<T>) {
    if let Err(e) = result {
        warn!(error = %e, "{what} failed");
    }
}
