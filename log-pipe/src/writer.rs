use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{LogPipeError, LogPipeResult};
use crate::fifo::is_pipe;

/// Largest formatted line the kernel writes to a pipe atomically.
pub const ATOMIC_LINE_LIMIT: usize = libc::PIPE_BUF;

/// `[<service>] <line>\n`, with any trailing line terminator of `line`
/// stripped first. Bytes are passed through as-is; no UTF-8 is required.
pub fn format_line(service: &str, line: &[u8]) -> Vec<u8> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let mut out = Vec::with_capacity(service.len() + line.len() + 4);
    out.push(b'[');
    out.extend_from_slice(service.as_bytes());
    out.extend_from_slice(b"] ");
    out.extend_from_slice(line);
    out.push(b'\n');
    out
}

/// Prefixes one service's output and writes it into the log pipe.
#[derive(Debug)]
pub struct Writer<W> {
    service_name: String,
    output: W,
}

impl Writer<File> {
    /// Open an existing log pipe for writing.
    ///
    /// The pipe is opened read-write so the open never blocks waiting for
    /// the reader. A missing pipe means chef-init is not running (or has
    /// already torn down), which is an error.
    pub fn open(path: &Path, service_name: impl Into<String>) -> LogPipeResult<Self> {
        if !is_pipe(path) {
            return Err(LogPipeError::MissingPipe(path.to_path_buf()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LogPipeError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(service_name, file))
    }
}

impl<W: Write> Writer<W> {
    pub fn new(service_name: impl Into<String>, output: W) -> Self {
        Self {
            service_name: service_name.into(),
            output,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Write one prefixed line in a single `write_all` and flush it.
    pub fn send(&mut self, line: &[u8]) -> io::Result<()> {
        let formatted = format_line(&self.service_name, line);
        if formatted.len() > ATOMIC_LINE_LIMIT {
            debug!(
                service = %self.service_name,
                len = formatted.len(),
                "log line exceeds PIPE_BUF and may interleave with other services"
            );
        }
        self.output.write_all(&formatted)?;
        self.output.flush()
    }

    /// Send every line of `input` until EOF. Returns the number of lines.
    pub fn forward<R: BufRead>(&mut self, mut input: R) -> io::Result<u64> {
        let mut line = Vec::with_capacity(512);
        let mut count = 0u64;
        loop {
            line.clear();
            if input.read_until(b'\n', &mut line)? == 0 {
                return Ok(count);
            }
            self.send(&line)?;
            count += 1;
        }
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}
