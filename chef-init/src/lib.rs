//! chef-init: PID 1 for Chef-managed containers.
//!
//! Starts a runit supervisor over the omnibus service directory, runs
//! chef-client against it, forwards every service's output to the container
//! log through a named pipe, and tears everything down on request.

pub mod cli;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod signals;
pub mod supervisor;
pub mod verify;

pub use cli::{Cli, HostEnv, Mode, Settings};
pub use error::{InitError, InitResult};
pub use orchestrator::{Event, Orchestrator, Phase, RunMode};
pub use supervisor::{ReadinessStrategy, ShutdownPolicy, Supervisor, SupervisorState};
