//! runit service directories.
//!
//! A service is staged under `<root>/sv/<name>` (`run`, `down`, `log/run`)
//! and activated by a symlink `<root>/service/<name>`, which is what
//! `runsvdir` watches. Everything after that goes through the `sv` control
//! binary, spawned through the process registry like every other child.

mod descriptor;
mod directory;
mod error;
mod strategy;

pub use descriptor::{LogMode, ServiceDescriptor};
pub use directory::{Readiness, ServiceDirectory, SvAction};
pub use error::{ServiceError, ServiceResult};
pub use strategy::{ServiceStrategy, container_services, load_attributes, service_strategy};
