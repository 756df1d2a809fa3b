//! Common utilities for the chef-init binaries.
//!
//! - Omnibus install layout and the augmented `PATH`
//! - Logging setup

pub mod layout;
pub mod log;

pub use layout::Layout;
