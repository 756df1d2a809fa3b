use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::reaper::Reaper;
use crate::status::ExitStatus;

/// Who is responsible for a child's exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The process supervision root.
    Supervisor,
    /// The configuration-management client run.
    Client,
    /// A short-lived control or status command.
    Helper,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Supervisor => "supervisor",
            Self::Client => "client",
            Self::Helper => "helper",
        };
        f.write_str(name)
    }
}

/// One OS process this program is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProcess {
    pub pid: Pid,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Inherit,
    Piped,
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Description of a process to spawn.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    process_group: bool,
    stdin: StdioMode,
    stdout: StdioMode,
    stderr: StdioMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            process_group: false,
            stdin: StdioMode::Null,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Override one environment variable. The rest of the environment is inherited.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Make the child the leader of a new process group (PGID == PID).
    pub fn process_group(mut self, leader: bool) -> Self {
        self.process_group = leader;
        self
    }

    pub fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Pipe both stdout and stderr back to the caller.
    pub fn capture_output(self) -> Self {
        self.stdout(StdioMode::Piped).stderr(StdioMode::Piped)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Human-readable command line.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Resolve the program against the overridden `PATH` (or ours).
    ///
    /// Done before forking so that a missing binary is reported without a
    /// child ever existing; a failed exec would otherwise be waited for by
    /// the standard library behind the reaper's back.
    fn resolve_program(&self) -> ProcessResult<PathBuf> {
        let search_path = self
            .env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok());
        let cwd = std::env::current_dir()?;
        which::which_in(&self.program, search_path, cwd).map_err(|e| ProcessError::Spawn {
            command: self.display(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
        })
    }

    fn to_command(&self, program: PathBuf) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(self.stdin.to_stdio())
            .stdout(self.stdout.to_stdio())
            .stderr(self.stderr.to_stdio());
        if self.process_group {
            cmd.process_group(0);
        }
        cmd
    }
}

/// A freshly spawned child. Holds the piped stdio handles, never the
/// `std::process::Child` itself: exit status only comes from the [`Reaper`].
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: Pid,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

#[derive(Debug, Default)]
pub(crate) struct Table {
    pub(crate) processes: HashMap<Pid, ManagedProcess>,
    pub(crate) pending: HashMap<Pid, ExitStatus>,
    /// Set while one caller is blocked in wait-any.
    pub(crate) waiting: bool,
}

impl Table {
    /// Attribute an observed exit. Registered children are parked in the
    /// pending table; anything else is an adopted orphan and is dropped.
    pub(crate) fn record(&mut self, pid: Pid, status: ExitStatus) {
        if self.processes.contains_key(&pid) {
            self.pending.entry(pid).or_insert(status);
        } else {
            debug!(pid = %pid, status = %status, "reaped orphan");
        }
    }

    /// Consume a pending status, retiring the registry record with it.
    pub(crate) fn take(&mut self, pid: Pid) -> Option<ExitStatus> {
        let status = self.pending.remove(&pid)?;
        self.processes.remove(&pid);
        Some(status)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    table: Mutex<Table>,
    pub(crate) observed: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, Table>) -> MutexGuard<'a, Table> {
        self.observed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks every child process this program is responsible for.
///
/// Cheap to clone; clones share one table. Construct one per program (or per
/// test) and hand clones to the components that spawn.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    shared: Arc<Shared>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reaper collecting exit statuses for this registry.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(Arc::clone(&self.shared))
    }

    /// Spawn a child and register it before anyone can observe its exit.
    ///
    /// The table lock is held across the fork so a concurrent wait-any that
    /// sees the child exit immediately still finds it registered.
    pub fn spawn(&self, spec: &CommandSpec, role: Role) -> ProcessResult<SpawnedProcess> {
        let program = spec.resolve_program()?;
        let mut command = spec.to_command(program);

        let mut table = self.shared.lock();
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: spec.display(),
            source,
        })?;
        let pid = Pid::from_raw(i32::try_from(child.id()).map_err(|e| ProcessError::Spawn {
            command: spec.display(),
            source: std::io::Error::other(e),
        })?);

        if table.pending.remove(&pid).is_some() {
            warn!(pid = %pid, "discarding uncollected status of a previous process with this pid");
        }
        table.processes.insert(
            pid,
            ManagedProcess {
                pid,
                command: spec.command_line(),
                env: spec.env.clone(),
                role,
            },
        );
        drop(table);

        debug!(pid = %pid, role = %role, command = %spec.display(), "spawned");
        Ok(SpawnedProcess {
            pid,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        })
    }

    pub fn get(&self, pid: Pid) -> Option<ManagedProcess> {
        self.shared.lock().processes.get(&pid).cloned()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.shared.lock().processes.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
