//! Top-level lifecycle of a chef-init process.
//!
//! ```text
//! Init -> SupervisorStarting -> SupervisorReady -> ClientRunning
//!   bootstrap: ClientRunning -> Cleanup -> ShuttingDown -> Exited
//!              (Cleanup also runs when chef-client fails to start)
//!   onboot:    ClientRunning -> Steady (<-> ClientRunning on rerun)
//!              Steady -> [Cleanup] -> ShuttingDown -> Exited
//! ```
//!
//! Whatever happens after the log pipe is up, the supervisor is shut down
//! and the pipe removed before [`Orchestrator::run`] returns.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use log_pipe::Reader;
use pid1::signals::send_signal;
use pid1::{ExitStatus, ProcessRegistry, Signal};
use service_dir::ServiceDirectory;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::Settings;
use crate::client::ClientRunner;
use crate::credentials::Credentials;
use crate::error::InitResult;
use crate::signals;
use crate::supervisor::Supervisor;

/// How long an interrupted chef-client gets between SIGTERM and SIGKILL.
const CLIENT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    SupervisorStarting,
    SupervisorReady,
    ClientRunning,
    Steady,
    Cleanup,
    ShuttingDown,
    Exited,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::SupervisorStarting => "supervisor-starting",
            Self::SupervisorReady => "supervisor-ready",
            Self::ClientRunning => "client-running",
            Self::Steady => "steady",
            Self::Cleanup => "cleanup",
            Self::ShuttingDown => "shutting-down",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run chef-client once, then keep supervising until told to stop.
    Onboot,
    /// Run chef-client once, clean credentials and exit with its code.
    Bootstrap,
}

/// External requests, usually translated from signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Shutdown,
    RerunClient,
    ShutdownAndClean,
}

enum ClientOutcome {
    Finished {
        status: ExitStatus,
        rerun_requested: bool,
    },
    Interrupted {
        event: Event,
        status: Option<ExitStatus>,
    },
}

pub struct Orchestrator {
    registry: ProcessRegistry,
    services: ServiceDirectory,
    supervisor: Supervisor,
    client: ClientRunner,
    credentials: Credentials,
    remove_secure: bool,
    log_pipe: PathBuf,
    attributes: PathBuf,
    events: mpsc::Receiver<Event>,
    phase: watch::Sender<Phase>,
    background: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(settings: Settings, registry: ProcessRegistry, events: mpsc::Receiver<Event>) -> Self {
        let services = ServiceDirectory::new(&settings.layout, registry.clone());
        let supervisor = Supervisor::new(
            &settings.layout,
            services.clone(),
            registry.clone(),
            settings.supervisor_pid_file.clone(),
        )
        .with_readiness(settings.readiness)
        .with_shutdown_policy(settings.shutdown.clone())
        .with_log_pipe(settings.log_pipe.clone());
        let client = ClientRunner::new(settings.client.clone(), &settings.layout, registry.clone());
        let (phase, _) = watch::channel(Phase::Init);

        Self {
            registry,
            services,
            supervisor,
            client,
            attributes: settings.client.json_attribs,
            credentials: settings.credentials,
            remove_secure: settings.remove_secure,
            log_pipe: settings.log_pipe,
            events,
            phase,
            background: Vec::new(),
        }
    }

    /// Run a different binary in place of `chef-client`.
    pub fn with_client_program(mut self, program: impl Into<String>) -> Self {
        self.client = self.client.with_program(program);
        self
    }

    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Run to completion and return the process exit code.
    ///
    /// Service output arriving on the log pipe is copied to `log_output`.
    /// An error is returned only after the supervisor has been stopped.
    pub async fn run<W>(mut self, mode: RunMode, log_output: W) -> InitResult<i32>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader = Reader::start(&self.log_pipe, log_output)?;
        info!(pipe = %self.log_pipe.display(), "log pipe ready");

        let outcome = self.drive(mode).await;
        if let Err(e) = &outcome {
            error!(error = %e, "aborting");
        }

        self.set_phase(Phase::ShuttingDown);
        for task in self.background.drain(..) {
            task.abort();
        }
        self.supervisor.shutdown().await;
        let reaped = self.registry.reaper().reap_available();
        if reaped > 0 {
            debug!(reaped, "reaped remaining children");
        }
        reader.shutdown().await;
        self.set_phase(Phase::Exited);
        outcome
    }

    async fn drive(&mut self, mode: RunMode) -> InitResult<i32> {
        self.set_phase(Phase::SupervisorStarting);
        self.stage_declared_services().await;
        self.supervisor.launch().await?;
        self.set_phase(Phase::SupervisorReady);

        match mode {
            RunMode::Bootstrap => self.bootstrap().await,
            RunMode::Onboot => self.onboot().await,
        }
    }

    async fn bootstrap(&mut self) -> InitResult<i32> {
        self.set_phase(Phase::ClientRunning);
        let outcome = self.run_client().await;
        // Credentials go even when the client could not be run or waited on.
        self.set_phase(Phase::Cleanup);
        self.credentials.clean(self.remove_secure);
        Ok(match outcome? {
            ClientOutcome::Finished { status, .. } => status.code(),
            ClientOutcome::Interrupted { status, .. } => status.map_or(1, |s| s.code()),
        })
    }

    async fn onboot(&mut self) -> InitResult<i32> {
        self.background.push(self.credentials.spawn_validation_key_cleanup());
        loop {
            self.set_phase(Phase::ClientRunning);
            match self.run_client().await? {
                ClientOutcome::Finished {
                    rerun_requested: true,
                    ..
                } => continue,
                ClientOutcome::Finished { .. } => {}
                ClientOutcome::Interrupted { event, .. } => return Ok(self.finish(event)),
            }

            self.set_phase(Phase::Steady);
            match self.steady().await {
                Event::RerunClient => {}
                event => return Ok(self.finish(event)),
            }
        }
    }

    /// Sweep orphans until the next event arrives.
    async fn steady(&mut self) -> Event {
        let sweeper = signals::spawn_orphan_sweeper(self.registry.reaper());
        let event = self.events.recv().await.unwrap_or(Event::Shutdown);
        sweeper.abort();
        debug!(event = ?event, "leaving steady state");
        event
    }

    fn finish(&mut self, event: Event) -> i32 {
        if event == Event::ShutdownAndClean {
            self.set_phase(Phase::Cleanup);
            self.credentials.clean(self.remove_secure);
        }
        0
    }

    /// Run chef-client while listening for events. A rerun request during a
    /// run is remembered once; any other event stops the client.
    async fn run_client(&mut self) -> InitResult<ClientOutcome> {
        let client = self.client.clone();
        let pid = client.spawn()?;
        let wait = client.wait(pid);
        tokio::pin!(wait);

        let mut rerun_requested = false;
        loop {
            tokio::select! {
                status = &mut wait => {
                    return Ok(ClientOutcome::Finished { status: status?, rerun_requested });
                }
                event = self.events.recv() => match event {
                    Some(Event::RerunClient) => {
                        if !rerun_requested {
                            info!("chef-client is running, queueing another run");
                        }
                        rerun_requested = true;
                    }
                    other => {
                        let event = other.unwrap_or(Event::Shutdown);
                        info!(pid = %pid, event = ?event, "interrupting chef-client");
                        client.terminate(pid);
                        let status = match tokio::time::timeout(CLIENT_STOP_TIMEOUT, &mut wait).await {
                            Ok(result) => result.ok(),
                            Err(_) => {
                                warn!(pid = %pid, "chef-client ignored SIGTERM, killing");
                                if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                                    warn!(pid = %pid, error = %e, "failed to kill chef-client");
                                }
                                tokio::time::timeout(CLIENT_STOP_TIMEOUT, &mut wait)
                                    .await
                                    .ok()
                                    .and_then(Result::ok)
                            }
                        };
                        return Ok(ClientOutcome::Interrupted { event, status });
                    }
                }
            }
        }
    }

    /// Stage `container_service` entries from the JSON attributes. They stay
    /// disabled until a recipe enables them.
    async fn stage_declared_services(&self) {
        let attributes = match service_dir::load_attributes(&self.attributes) {
            Ok(attributes) => attributes,
            Err(e) => {
                warn!(path = %self.attributes.display(), error = %e, "ignoring JSON attributes");
                return;
            }
        };
        let declared = match service_dir::container_services(&attributes) {
            Ok(declared) => declared,
            Err(e) => {
                warn!(error = %e, "invalid container_service attributes");
                return;
            }
        };
        for descriptor in declared.values() {
            match self.services.setup(descriptor).await {
                Ok(()) => debug!(service = %descriptor.name, "staged service"),
                Err(e) => warn!(service = %descriptor.name, error = %e, "failed to stage service"),
            }
        }
        if !declared.is_empty() {
            info!(count = declared.len(), "staged declared container services");
        }
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            info!(from = %previous, to = %phase, "phase");
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("phase", &self.phase())
            .field("supervisor", &self.supervisor.state())
            .field("log_pipe", &self.log_pipe)
            .finish_non_exhaustive()
    }
}
