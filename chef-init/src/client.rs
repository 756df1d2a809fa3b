//! chef-client runs.

use std::path::PathBuf;

use init_common::Layout;
use pid1::signals::send_signal;
use pid1::{CommandSpec, ExitStatus, Pid, ProcessRegistry, Role, Signal};
use tracing::{info, warn};

use crate::error::InitResult;

const CLIENT_BIN: &str = "chef-client";

/// Arguments passed to every chef-client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientArgs {
    pub config_file: PathBuf,
    pub json_attribs: PathBuf,
    pub log_level: String,
    pub local_mode: bool,
    pub environment: Option<String>,
    pub node_name: Option<String>,
}

impl ClientArgs {
    /// `-c <config> -j <attrs> -l <level> [-z] [-E <env>] [-N <node>]`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.config_file.display().to_string(),
            "-j".to_string(),
            self.json_attribs.display().to_string(),
            "-l".to_string(),
            self.log_level.clone(),
        ];
        if self.local_mode {
            args.push("-z".to_string());
        }
        if let Some(env) = &self.environment {
            args.extend(["-E".to_string(), env.clone()]);
        }
        if let Some(node) = &self.node_name {
            args.extend(["-N".to_string(), node.clone()]);
        }
        args
    }
}

/// Runs chef-client to completion.
///
/// The client inherits stdout and stderr, so its output reaches the
/// container log as it is written. Its exit code is data, not an error.
#[derive(Debug, Clone)]
pub struct ClientRunner {
    program: String,
    args: ClientArgs,
    search_path: String,
    registry: ProcessRegistry,
}

impl ClientRunner {
    pub fn new(args: ClientArgs, layout: &Layout, registry: ProcessRegistry) -> Self {
        Self {
            program: CLIENT_BIN.to_string(),
            args,
            search_path: layout.search_path(),
            registry,
        }
    }

    /// Run a different binary in place of `chef-client`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn args(&self) -> &ClientArgs {
        &self.args
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.program.clone())
            .args(self.args.to_args())
            .env("PATH", self.search_path.clone())
    }

    /// Start a run. A missing binary fails here, before any child exists.
    pub fn spawn(&self) -> InitResult<Pid> {
        let child = self.registry.spawn(&self.command(), Role::Client)?;
        info!(pid = %child.pid, "chef-client started");
        Ok(child.pid)
    }

    pub async fn wait(&self, pid: Pid) -> InitResult<ExitStatus> {
        let status = self.registry.reaper().wait(pid).await?;
        if status.success() {
            info!(pid = %pid, "chef-client finished");
        } else {
            warn!(pid = %pid, status = %status, "chef-client failed");
        }
        Ok(status)
    }

    pub async fn run(&self) -> InitResult<ExitStatus> {
        let pid = self.spawn()?;
        self.wait(pid).await
    }

    /// Ask a running client to stop.
    pub fn terminate(&self, pid: Pid) {
        if let Err(e) = send_signal(pid, Signal::SIGTERM) {
            warn!(pid = %pid, error = %e, "failed to signal chef-client");
        }
    }
}
