//! Lifecycle of the runit supervisor (`runsvdir`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use init_common::Layout;
use init_common::layout::LOG_PIPE_ENV;
use pid1::signals::{send_signal, signal_group};
use pid1::{CommandSpec, ExitStatus, Pid, ProcessRegistry, Role, Signal};
use service_dir::{Readiness, ServiceDirectory, SvAction};
use tracing::{debug, info, warn};

use crate::error::{InitError, InitResult};

/// Log sink argument for runsvdir: its status line is `log: ` followed by
/// a buffer of dots that runsvdir overwrites with service errors.
const LOG_SINK_DOTS: usize = 395;

const READINESS_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Launching,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How `launch` decides runsvdir is up. runsvdir has no readiness
/// notification, so both are polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStrategy {
    /// Sleep a fixed time.
    SettleDelay(Duration),
    /// Wait until every activated service has its `supervise/ok` pipes,
    /// for at most `timeout`.
    ControlPipes { timeout: Duration },
}

impl Default for ReadinessStrategy {
    fn default() -> Self {
        Self::SettleDelay(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub signal: Signal,
    pub timeout: Duration,
}

/// Signals and timeouts for [`Supervisor::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Sent to runsvdir alone; runsvdir forwards a TERM to every runsv.
    pub graceful_signal: Signal,
    pub graceful_timeout: Duration,
    /// Sent to runsvdir's whole process group, in order.
    pub escalation: Vec<EscalationStep>,
    /// Bound on each `sv stop` / `sv exit` call.
    pub control_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            graceful_signal: Signal::SIGHUP,
            graceful_timeout: Duration::from_secs(10),
            escalation: vec![
                EscalationStep {
                    signal: Signal::SIGTERM,
                    timeout: Duration::from_secs(3),
                },
                EscalationStep {
                    signal: Signal::SIGKILL,
                    timeout: Duration::from_secs(3),
                },
            ],
            control_timeout: Duration::from_secs(5),
        }
    }
}

impl ShutdownPolicy {
    /// Upper bound on [`Supervisor::shutdown`] for `services` activated services.
    pub fn max_duration(&self, services: usize) -> Duration {
        let control = self.control_timeout * u32::try_from(services * 2).unwrap_or(u32::MAX);
        self.escalation
            .iter()
            .fold(control + self.graceful_timeout, |acc, step| acc + step.timeout)
    }
}

/// Owns the runsvdir process.
#[derive(Debug)]
pub struct Supervisor {
    runsvdir_bin: PathBuf,
    search_path: String,
    pid_file: PathBuf,
    log_pipe: Option<PathBuf>,
    registry: ProcessRegistry,
    services: ServiceDirectory,
    readiness: ReadinessStrategy,
    policy: ShutdownPolicy,
    state: SupervisorState,
    pid: Option<Pid>,
}

impl Supervisor {
    pub fn new(
        layout: &Layout,
        services: ServiceDirectory,
        registry: ProcessRegistry,
        pid_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runsvdir_bin: layout.runsvdir_bin(),
            search_path: layout.search_path(),
            pid_file: pid_file.into(),
            log_pipe: None,
            registry,
            services,
            readiness: ReadinessStrategy::default(),
            policy: ShutdownPolicy::default(),
            state: SupervisorState::NotStarted,
            pid: None,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessStrategy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Export the log pipe location to every service's log writer.
    pub fn with_log_pipe(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_pipe = Some(path.into());
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn services(&self) -> &ServiceDirectory {
        &self.services
    }

    fn command(&self) -> CommandSpec {
        let spec = CommandSpec::new(self.runsvdir_bin.display().to_string())
            .arg("-P")
            .arg(self.services.active_root().display().to_string())
            .arg(format!("log: {}", ".".repeat(LOG_SINK_DOTS)))
            .env("PATH", self.search_path.clone())
            .process_group(true);
        match &self.log_pipe {
            Some(path) => spec.env(LOG_PIPE_ENV, path.display().to_string()),
            None => spec,
        }
    }

    /// Start runsvdir and wait until it is ready.
    ///
    /// runsvdir leads its own process group so the escalation signals in
    /// [`shutdown`](Self::shutdown) reach every runsv beneath it.
    pub async fn launch(&mut self) -> InitResult<Pid> {
        self.state = SupervisorState::Launching;
        tokio::fs::create_dir_all(self.services.active_root()).await?;

        let child = match self.registry.spawn(&self.command(), Role::Supervisor) {
            Ok(child) => child,
            Err(e) => {
                self.state = SupervisorState::Stopped;
                return Err(e.into());
            }
        };
        let pid = child.pid;
        self.pid = Some(pid);
        info!(pid = %pid, "supervisor started");

        if let Err(e) = tokio::fs::write(&self.pid_file, format!("{pid}\n")).await {
            warn!(path = %self.pid_file.display(), error = %e, "failed to write supervisor pid file");
        }

        debug!(strategy = ?self.readiness, "waiting for supervisor");
        if let Err(e) = self.wait_ready(pid).await {
            if matches!(e, InitError::SupervisorExited(_)) {
                self.pid = None;
                self.state = SupervisorState::Stopped;
                self.remove_pid_file().await;
            }
            return Err(e);
        }

        self.state = SupervisorState::Running;
        info!(pid = %pid, "supervisor ready");
        Ok(pid)
    }

    async fn wait_ready(&self, pid: Pid) -> InitResult<()> {
        let reaper = self.registry.reaper();
        match self.readiness {
            ReadinessStrategy::SettleDelay(delay) => {
                if let Some(status) = reaper.wait_timeout(pid, delay).await? {
                    return Err(InitError::SupervisorExited(status));
                }
                Ok(())
            }
            ReadinessStrategy::ControlPipes { timeout } => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if let Some(status) = reaper.try_wait_for(pid)? {
                        return Err(InitError::SupervisorExited(status));
                    }
                    let pending: Vec<String> = self
                        .services
                        .list()?
                        .into_iter()
                        .filter(|name| self.services.readiness(name) == Readiness::NotReadyYet)
                        .collect();
                    if pending.is_empty() {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        warn!(services = ?pending, "services not supervised yet, continuing");
                        return Ok(());
                    }
                    tokio::time::sleep(READINESS_POLL).await;
                }
            }
        }
    }

    /// Stop every service, then runsvdir itself, escalating to signals on
    /// its process group. Every step is best-effort; the whole sequence is
    /// bounded by [`ShutdownPolicy::max_duration`].
    ///
    /// Returns runsvdir's exit status, or `None` if it was never started or
    /// could not be collected.
    pub async fn shutdown(&mut self) -> Option<ExitStatus> {
        let Some(pid) = self.pid else {
            self.state = SupervisorState::Stopped;
            return None;
        };
        self.state = SupervisorState::ShuttingDown;
        info!(pid = %pid, "shutting down supervisor");

        let services = self.services.list().unwrap_or_else(|e| {
            warn!(error = %e, "failed to list services");
            Vec::new()
        });
        for action in [SvAction::Stop, SvAction::Exit] {
            debug!(action = action.as_str(), count = services.len(), "sv on all services");
            for name in &services {
                self.control(action, name).await;
            }
        }

        let status = self.stop_root(pid).await;

        let reaped = self.registry.reaper().reap_available();
        if reaped > 0 {
            debug!(reaped, "reaped leftover supervisor children");
        }
        self.remove_pid_file().await;
        self.pid = None;
        self.state = SupervisorState::Stopped;
        match status {
            Some(status) => info!(status = %status, "supervisor stopped"),
            None => warn!(pid = %pid, "supervisor did not exit"),
        }
        status
    }

    async fn control(&self, action: SvAction, name: &str) {
        let call = self.services.control(action, name);
        match tokio::time::timeout(self.policy.control_timeout, call).await {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => warn!(
                service = name,
                action = action.as_str(),
                status = %output.status,
                stderr = %output.stderr.trim(),
                "sv failed"
            ),
            Ok(Err(e)) => warn!(service = name, action = action.as_str(), error = %e, "sv failed"),
            Err(_) => warn!(service = name, action = action.as_str(), "sv timed out"),
        }
    }

    async fn stop_root(&self, pid: Pid) -> Option<ExitStatus> {
        let reaper = self.registry.reaper();

        debug!(pid = %pid, signal = %self.policy.graceful_signal, "graceful signal");
        if let Err(e) = send_signal(pid, self.policy.graceful_signal) {
            warn!(pid = %pid, error = %e, "graceful signal failed");
        }
        match reaper.wait_timeout(pid, self.policy.graceful_timeout).await {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!(pid = %pid, error = %e, "wait for supervisor failed");
                return None;
            }
        }

        for step in &self.policy.escalation {
            debug!(pgid = %pid, signal = %step.signal, "escalating");
            match signal_group(pid, step.signal) {
                Ok(true) => {}
                Ok(false) => debug!(pgid = %pid, "process group already gone"),
                Err(e) => warn!(pgid = %pid, error = %e, "escalation signal failed"),
            }
            match reaper.wait_timeout(pid, step.timeout).await {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = %pid, error = %e, "wait for supervisor failed");
                    return None;
                }
            }
        }
        None
    }

    async fn remove_pid_file(&self) {
        match tokio::fs::remove_file(&self.pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.pid_file.display(), error = %e, "failed to remove pid file"),
        }
    }
}
