use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{LogPipeError, LogPipeResult};
use crate::fifo::{create_pipe, remove_pipe};

/// Drains the log pipe into an output stream, one line at a time.
///
/// The pipe is opened read-write so the reader keeps its own write end:
/// with zero writers connected the read simply blocks instead of hitting
/// EOF, and writers may come and go freely.
#[derive(Debug)]
pub struct Reader {
    path: PathBuf,
    task: Option<JoinHandle<io::Result<u64>>>,
}

impl Reader {
    /// Create the pipe at `path` and start forwarding its lines to `output`.
    ///
    /// Must be called from within a tokio runtime. Fails if the pipe cannot
    /// be created or opened; nothing is left behind in that case.
    pub fn start<W>(path: impl Into<PathBuf>, output: W) -> LogPipeResult<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let path = path.into();
        create_pipe(&path)?;

        let receiver = match pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)
        {
            Ok(receiver) => receiver,
            Err(source) => {
                remove_pipe(&path);
                return Err(LogPipeError::Open { path, source });
            }
        };

        info!(path = %path.display(), "log pipe reader started");
        let task = tokio::spawn(forward(receiver, output));
        Ok(Self {
            path,
            task: Some(task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop reading and remove the pipe.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Ok(Ok(lines)) => debug!(lines, "log pipe reader finished"),
                Ok(Err(e)) => warn!(error = %e, "log pipe reader failed"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "log pipe reader task panicked"),
            }
        }
        remove_pipe(&self.path);
        info!(path = %self.path.display(), "log pipe reader stopped");
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            remove_pipe(&self.path);
        }
    }
}

/// Copy whole lines from `input` to `output`, flushing after each so the
/// container log sees them immediately. Returns the number of lines copied
/// once `input` reaches EOF.
async fn forward<R, W>(input: R, mut output: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = BufReader::new(input);
    let mut line = Vec::with_capacity(512);
    let mut count = 0u64;
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line).await? == 0 {
            return Ok(count);
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        output.write_all(&line).await?;
        output.flush().await?;
        count += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::timeout;

    use super::*;
    use crate::writer::Writer;

    async fn next_line<R: AsyncRead + Unpin>(lines: &mut tokio::io::Lines<BufReader<R>>) -> String {
        timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for a log line")
            .unwrap()
            .expect("log output closed")
    }

    #[tokio::test]
    async fn forward_terminates_trailing_fragment() {
        let mut out = Vec::new();
        let n = forward(&b"one\ntwo"[..], &mut out).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, b"one\ntwo\n");
    }

    #[tokio::test]
    async fn forwards_prefixed_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        let (out_tx, out_rx) = tokio::io::duplex(4096);
        let reader = Reader::start(&path, out_tx).unwrap();

        let mut writer = Writer::open(&path, "svc").unwrap();
        for line in ["a", "b", "c"] {
            writer.send(line.as_bytes()).unwrap();
        }

        let mut lines = BufReader::new(out_rx).lines();
        assert_eq!(next_line(&mut lines).await, "[svc] a");
        assert_eq!(next_line(&mut lines).await, "[svc] b");
        assert_eq!(next_line(&mut lines).await, "[svc] c");

        reader.shutdown().await;
    }

    #[tokio::test]
    async fn survives_writers_coming_and_going() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        let (out_tx, out_rx) = tokio::io::duplex(4096);
        let reader = Reader::start(&path, out_tx).unwrap();
        let mut lines = BufReader::new(out_rx).lines();

        // No writer at all for a while: the reader must not see EOF.
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let mut first = Writer::open(&path, "first").unwrap();
            first.send(b"hello").unwrap();
        }
        assert_eq!(next_line(&mut lines).await, "[first] hello");

        let mut second = Writer::open(&path, "second").unwrap();
        second.send(b"again").unwrap();
        assert_eq!(next_line(&mut lines).await, "[second] again");

        reader.shutdown().await;
    }

    #[tokio::test]
    async fn lines_from_several_writers_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        let (out_tx, out_rx) = tokio::io::duplex(64 * 1024);
        let reader = Reader::start(&path, out_tx).unwrap();

        let handles: Vec<_> = ["alpha", "beta", "gamma"]
            .into_iter()
            .map(|name| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut writer = Writer::open(&path, name).unwrap();
                    for i in 0..50 {
                        writer.send(format!("line {i}").as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut lines = BufReader::new(out_rx).lines();
        let mut per_writer = std::collections::HashMap::<String, Vec<u32>>::new();
        for _ in 0..150 {
            let line = next_line(&mut lines).await;
            let (prefix, rest) = line.split_once("] line ").expect("malformed line");
            per_writer
                .entry(prefix.trim_start_matches('[').to_string())
                .or_default()
                .push(rest.parse().unwrap());
        }
        for name in ["alpha", "beta", "gamma"] {
            let seen = &per_writer[name];
            assert_eq!(seen, &(0..50).collect::<Vec<_>>(), "order broken for {name}");
        }

        reader.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_removes_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        let reader = Reader::start(&path, tokio::io::sink()).unwrap();
        assert!(path.exists());
        reader.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        drop(Reader::start(&path, tokio::io::sink()).unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn start_fails_fast_when_pipe_cannot_be_created() {
        let err = Reader::start("/nonexistent/dir/logs", tokio::io::sink()).unwrap_err();
        assert!(matches!(err, LogPipeError::CreatePipe { .. }));
    }
}
