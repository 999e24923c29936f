use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const OUTPUT_TAIL_LINES: usize = 500;
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// The most recent output lines of a launched process, in the order written.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

/// Spawn the task that drains `stdout` and `stderr` line by line.
///
/// Both streams are read concurrently into the same `tail`, so lines keep their
/// order within a stream. Every line is echoed to stdout (when `echo` is set).
/// The first line on either stream containing `marker` fires `ready_tx`; the
/// task keeps draining afterwards so the child never blocks on a full pipe.
/// If both streams end without the marker, `ready_tx` is dropped.
pub(crate) fn spawn_output_reader<O, E>(
    container: String,
    stdout: O,
    stderr: E,
    marker: String,
    echo: bool,
    tail: OutputTail,
    ready_tx: oneshot::Sender<()>,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let ready_tx = Mutex::new(Some(ready_tx));
        let stream = LineStream {
            container: &container,
            marker: &marker,
            echo,
            tail: &tail,
            ready_tx: &ready_tx,
        };

        tokio::join!(stream.drain(stdout, "stdout"), stream.drain(stderr, "stderr"));
        log::debug!("Output streams of '{container}' closed");
    })
}

#[derive(Clone, Copy)]
struct LineStream<'a> {
    container: &'a str,
    marker: &'a str,
    echo: bool,
    tail: &'a OutputTail,
    ready_tx: &'a Mutex<Option<oneshot::Sender<()>>>,
}

impl LineStream<'_> {
    async fn drain<R>(self, stream: R, label: &str)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match read_line_capped(&mut reader, &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Failed to read {label} of '{}': {e}", self.container);
                    break;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if self.echo {
                println!("{line}");
            }
            if line.contains(self.marker) {
                self.signal_ready();
            }
            self.tail.push(line.to_string());
        }
    }

    fn signal_ready(&self) {
        let sender = match self.ready_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }
}

/// Read up to and including the next `\n`, but never more than
/// [`MAX_LINE_BYTES`]; longer lines come back in pieces.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }

        let room = MAX_LINE_BYTES - buf.len();
        let window = &available[..available.len().min(room)];
        let (used, done) = match window.iter().position(|&b| b == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (window.len(), buf.len() + window.len() >= MAX_LINE_BYTES),
        };
        buf.extend_from_slice(&window[..used]);
        reader.consume(used);
        read += used;

        if done {
            return Ok(read);
        }
    }
}
