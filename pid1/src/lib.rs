//! Process bookkeeping for a program running as PID 1.
//!
//! Every child this program spawns goes through [`ProcessRegistry`], and
//! every exit status is collected through [`Reaper`]. Nothing else in the
//! process may call `wait` on its own: the reaper waits on *any* child, so a
//! library-level `wait` on a specific child would race with it.

pub mod command;
mod error;
mod reaper;
mod registry;
pub mod signals;
mod status;

pub use error::{ProcessError, ProcessResult};
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use reaper::Reaper;
pub use registry::{CommandSpec, ManagedProcess, ProcessRegistry, Role, SpawnedProcess, StdioMode};
pub use status::ExitStatus;
