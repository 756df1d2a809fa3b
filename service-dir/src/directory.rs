use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use init_common::Layout;
use pid1::command::{self, Output};
use pid1::{CommandSpec, ProcessRegistry};
use tracing::{debug, info, warn};

use crate::descriptor::{LogMode, ServiceDescriptor, validate_name};
use crate::error::{ServiceError, ServiceResult};

const DEFAULT_FILE_LOG_ROOT: &str = "/var/log";
const DEFAULT_SUPERVISE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// `sv` subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvAction {
    Start,
    Stop,
    Restart,
    ForceReload,
    Status,
    Up,
    Down,
    Exit,
}

impl SvAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::ForceReload => "force-reload",
            Self::Status => "status",
            Self::Up => "up",
            Self::Down => "down",
            Self::Exit => "exit",
        }
    }
}

/// Whether runsv has picked a service up yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReadyYet,
}

/// The staging and active service roots plus the `sv` binary that controls them.
#[derive(Debug, Clone)]
pub struct ServiceDirectory {
    staging: PathBuf,
    active: PathBuf,
    sv_bin: PathBuf,
    file_log_root: PathBuf,
    search_path: String,
    supervise_timeout: Duration,
    registry: ProcessRegistry,
}

impl ServiceDirectory {
    pub fn new(layout: &Layout, registry: ProcessRegistry) -> Self {
        Self {
            staging: layout.staging_dir(),
            active: layout.service_dir(),
            sv_bin: layout.sv_bin(),
            file_log_root: PathBuf::from(DEFAULT_FILE_LOG_ROOT),
            search_path: layout.search_path(),
            supervise_timeout: DEFAULT_SUPERVISE_TIMEOUT,
            registry,
        }
    }

    /// Directory that holds `<name>/` for services in file log mode.
    pub fn with_file_log_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.file_log_root = root.into();
        self
    }

    /// How long `start` waits for runsv to pick a service up.
    pub fn with_supervise_timeout(mut self, timeout: Duration) -> Self {
        self.supervise_timeout = timeout;
        self
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging
    }

    pub fn active_root(&self) -> &Path {
        &self.active
    }

    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.staging.join(name)
    }

    pub fn active_path(&self, name: &str) -> PathBuf {
        self.active.join(name)
    }

    /// Write the service's on-disk representation and activate it.
    ///
    /// The service starts out disabled (`down` present); runsvdir supervises
    /// it but does not start it until [`enable`](Self::enable). Safe to call
    /// again for an existing service: scripts are rewritten, and the `down`
    /// marker is only created the first time, so an enabled service stays
    /// enabled.
    pub async fn setup(&self, service: &ServiceDescriptor) -> ServiceResult<()> {
        let staging = self.staging_path(&service.name);
        debug!(service = %service.name, path = %staging.display(), "staging service");

        let run = staging.join("run");
        let first_setup = !tokio::fs::try_exists(&run)
            .await
            .map_err(ServiceError::io(&run))?;

        create_dir(&staging).await?;
        if first_setup {
            let down = staging.join("down");
            tokio::fs::write(&down, b"")
                .await
                .map_err(ServiceError::io(&down))?;
        }
        write_script(&run, &service.run_script()).await?;

        if service.log_mode == LogMode::File {
            create_dir(&self.file_log_root.join(&service.name)).await?;
        }
        let log_dir = staging.join("log");
        create_dir(&log_dir).await?;
        write_script(&log_dir.join("run"), &service.log_run_script(&self.file_log_root)).await?;

        self.link(&service.name, &staging).await?;
        info!(service = %service.name, log_mode = %service.log_mode, "service staged");
        Ok(())
    }

    async fn link(&self, name: &str, target: &Path) -> ServiceResult<()> {
        create_dir(&self.active).await?;
        let link = self.active_path(name);
        match tokio::fs::read_link(&link).await {
            Ok(existing) if existing == target => return Ok(()),
            Ok(_) => {
                tokio::fs::remove_file(&link)
                    .await
                    .map_err(ServiceError::io(&link))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ServiceError::Io { path: link, source }),
        }
        tokio::fs::symlink(target, &link)
            .await
            .map_err(ServiceError::io(&link))
    }

    /// Remove the `down` marker so runsv starts the service.
    pub async fn enable(&self, name: &str) -> ServiceResult<()> {
        validate_name(name)?;
        let down = self.staging_path(name).join("down");
        match tokio::fs::remove_file(&down).await {
            Ok(()) => {
                info!(service = name, "service enabled");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ServiceError::Io { path: down, source }),
        }
    }

    /// Create the `down` marker and bring the service down. A failing
    /// `sv down` is only logged; the marker alone keeps it from restarting.
    pub async fn disable(&self, name: &str) -> ServiceResult<()> {
        validate_name(name)?;
        let down = self.staging_path(name).join("down");
        tokio::fs::write(&down, b"")
            .await
            .map_err(ServiceError::io(&down))?;
        let output = self.control(SvAction::Down, name).await?;
        if !output.status.success() {
            warn!(service = name, status = %output.status, "sv down failed");
        }
        info!(service = name, "service disabled");
        Ok(())
    }

    /// Wait until runsv supervises the service, then `sv start` it.
    pub async fn start(&self, name: &str) -> ServiceResult<()> {
        self.wait_until_supervised(name, self.supervise_timeout)
            .await?;
        self.checked(SvAction::Start, name).await
    }

    pub async fn stop(&self, name: &str) -> ServiceResult<()> {
        self.checked(SvAction::Stop, name).await
    }

    pub async fn restart(&self, name: &str) -> ServiceResult<()> {
        self.checked(SvAction::Restart, name).await
    }

    pub async fn reload(&self, name: &str) -> ServiceResult<()> {
        self.checked(SvAction::ForceReload, name).await
    }

    /// Raw `sv status` output.
    pub async fn status(&self, name: &str) -> ServiceResult<Output> {
        self.control(SvAction::Status, name).await
    }

    /// `sv status` exited 0 and reported `run:`.
    pub async fn is_running(&self, name: &str) -> ServiceResult<bool> {
        let output = self.status(name).await?;
        Ok(output.status.success() && output.stdout.lines().any(|l| l.starts_with("run:")))
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.active_path(name).join("down").exists()
    }

    /// Names of all activated services, sorted.
    pub fn list(&self) -> ServiceResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.active) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ServiceError::Io {
                    path: self.active.clone(),
                    source,
                });
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(ServiceError::io(&self.active))?;
            if let Some(name) = entry.file_name().to_str()
                && !name.starts_with('.')
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Ready once runsv has created both control pipes for the service and
    /// its log process.
    pub fn readiness(&self, name: &str) -> Readiness {
        let dir = self.active_path(name);
        if is_fifo(&dir.join("supervise").join("ok"))
            && is_fifo(&dir.join("log").join("supervise").join("ok"))
        {
            Readiness::Ready
        } else {
            Readiness::NotReadyYet
        }
    }

    /// Poll [`readiness`](Self::readiness) until `Ready` or `timeout`.
    pub async fn wait_until_supervised(&self, name: &str, timeout: Duration) -> ServiceResult<()> {
        validate_name(name)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.readiness(name) == Readiness::Ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ServiceError::NotSupervised {
                    service: name.to_string(),
                    waited: timeout,
                });
            }
            debug!(service = name, "waiting for supervise/ok");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Run `sv <action> <active path>` and return its output, whatever the
    /// exit status.
    pub async fn control(&self, action: SvAction, name: &str) -> ServiceResult<Output> {
        validate_name(name)?;
        let spec = CommandSpec::new(self.sv_bin.display().to_string())
            .arg(action.as_str())
            .arg(self.active_path(name).display().to_string())
            .env("PATH", self.search_path.clone());
        Ok(command::exec(&self.registry, spec).await?)
    }

    async fn checked(&self, action: SvAction, name: &str) -> ServiceResult<()> {
        let output = self.control(action, name).await?;
        if !output.status.success() {
            return Err(ServiceError::Control {
                action: action.as_str(),
                service: name.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!(service = name, action = action.as_str(), "sv ok");
        Ok(())
    }
}

fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

async fn create_dir(path: &Path) -> ServiceResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(ServiceError::io(path))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(ServiceError::io(path))
}

/// Write an executable script via a temp file and rename, so runsv never
/// execs a half-written file.
async fn write_script(path: &Path, content: &str) -> ServiceResult<()> {
    let tmp = path.with_extension("tmp");
    let result = async {
        tokio::fs::write(&tmp, content)
            .await
            .map_err(ServiceError::io(&tmp))?;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(ServiceError::io(&tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(ServiceError::io(path))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}
