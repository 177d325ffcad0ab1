//! Relay tasks between a child's pipes and the session's client channels.
//!
//! Two `pump` tasks (stdout, stderr) push decoded chunks into one bounded
//! queue as soon as the pipe yields data. One `feed` task writes client lines
//! to stdin. Order is kept within a channel, not across channels.

use std::io;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// Which standard stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
}

/// One unit of process output. `sequence` counts up from zero per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub channel: Channel,
    pub payload: String,
    pub sequence: u64,
}

/// Everything a session sends towards its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(StreamChunk),
    /// Human readable failure, sent on the stderr channel.
    Error(String),
}

/// Forward everything `reader` yields until EOF, a read error, or the
/// receiving side closing. Returns the number of chunks sent.
///
/// Once `stop` fires the pump still takes whatever the pipe has ready, but
/// gives up instead of waiting for more. Waiting for queue space is never cut
/// short here.
pub async fn pump<R>(
    mut reader: R,
    channel: Channel,
    events: mpsc::Sender<SessionEvent>,
    stop: CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Carry::default();
    let mut sequence = 0;

    loop {
        let read = tokio::select! {
            biased;
            read = reader.read(&mut buf) => read,
            () = stop.cancelled() => {
                debug!(?channel, "Pipe still open after the drain window, giving up");
                break;
            }
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?channel, error = %e, "Pipe read failed");
                break;
            }
        };
        let text = decoder.push(&buf[..n]);
        if text.is_empty() {
            continue;
        }
        if !emit(&events, channel, &mut sequence, text).await {
            return sequence;
        }
    }

    if let Some(rest) = decoder.finish() {
        emit(&events, channel, &mut sequence, rest).await;
    }
    debug!(?channel, chunks = sequence, "Pipe drained");
    sequence
}

async fn emit(
    events: &mpsc::Sender<SessionEvent>,
    channel: Channel,
    sequence: &mut u64,
    payload: String,
) -> bool {
    let chunk = StreamChunk {
        channel,
        payload,
        sequence: *sequence,
    };
    if events.send(SessionEvent::Output(chunk)).await.is_err() {
        debug!(?channel, "Client queue closed, dropping output");
        return false;
    }
    *sequence += 1;
    true
}

/// Write each client line to `stdin` with a trailing newline.
///
/// Runs until the client side of `lines` closes, then cancels `disconnect`.
/// If the process stops reading, remaining lines are discarded but the task
/// keeps watching for the client to leave.
pub async fn feed<W>(mut stdin: W, mut lines: mpsc::Receiver<String>, disconnect: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut open = true;
    while let Some(line) = lines.recv().await {
        if !open {
            continue;
        }
        if let Err(e) = write_line(&mut stdin, &line).await {
            debug!(error = %e, "Process stdin closed");
            open = false;
        }
    }
    debug!("Client input closed");
    disconnect.cancel();
}

async fn write_line<W: AsyncWrite + Unpin>(stdin: &mut W, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Wait for relay tasks to finish once the process is gone.
///
/// After `grace` the relays stop waiting on their pipes (`stop` is
/// cancelled). Relays still blocked on a full client queue are aborted at
/// `limit`. Returns `false` when output was cut off that way.
pub async fn drain(
    tasks: impl IntoIterator<Item = JoinHandle<u64>>,
    grace: Duration,
    stop: &CancellationToken,
    limit: Duration,
) -> bool {
    let stop_reads = stop.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        stop_reads.cancel();
    });

    let deadline = Instant::now() + limit.max(grace);
    let mut flushed = true;
    for mut task in tasks {
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Relay task failed"),
            Err(_) => {
                warn!("Relay still waiting on the client queue, aborting");
                task.abort();
                flushed = false;
            }
        }
    }
    timer.abort();
    flushed
}

/// Incremental UTF-8 decoder that holds back an incomplete trailing sequence.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // incomplete sequence at the end, wait for the rest
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
