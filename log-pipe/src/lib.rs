//! Log fan-in over a single named pipe.
//!
//! Every supervised service gets its own [`Writer`] (run as the service's
//! log process), which prefixes each line with `[<service>] ` and writes it
//! to the shared FIFO in one `write`. One [`Reader`] inside chef-init drains
//! the FIFO to stdout.
//!
//! Lines from one writer keep their order. Lines from different writers do
//! not interleave mid-line as long as each formatted line fits in
//! [`ATOMIC_LINE_LIMIT`] bytes (`PIPE_BUF`); longer lines may be split by
//! the kernel and mixed with other writers' output.

mod error;
mod fifo;
mod reader;
mod writer;

pub use error::{LogPipeError, LogPipeResult};
pub use fifo::{create_pipe, remove_pipe};
pub use reader::Reader;
pub use writer::{ATOMIC_LINE_LIMIT, Writer, format_line};
