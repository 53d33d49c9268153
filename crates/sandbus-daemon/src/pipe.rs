//! Draining of child process output pipes
//!
//! A child writing to a pipe nobody reads will eventually block on a full
//! pipe buffer. Every pipe of the bus daemon therefore gets a drainer task
//! that reads it line by line until end-of-stream and forwards each line to
//! a [`LineSink`]. There is no external cancellation: closing the pipe (by
//! terminating the process that writes it) is the only way a drainer ends.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sandbus_core::logging::BUS_TARGET;
use sandbus_core::prelude::*;

/// Default prefix of log lines emitted by the supervised services.
///
/// Services run with `G_MESSAGES_PREFIXED=all`, so their messages look like
/// `(tracker-miner-fs-3:1234): ...`.
pub const DEFAULT_SERVICE_LINE_PREFIX: &str = "(tracker-";

/// Longest line read in one piece; longer output is split into several lines
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Maximum number of stderr lines kept for start-failure diagnostics
pub const DEFAULT_TAIL_CAPACITY: usize = 64;

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSource {
    Stdout,
    Stderr,
}

impl PipeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PipeSource::Stdout => "stdout",
            PipeSource::Stderr => "stderr",
        }
    }
}

/// Receives every line a drainer reads
pub trait LineSink: Send + 'static {
    fn line(&mut self, source: PipeSource, line: String);
}

/// Forward lines into a channel (used by tests and embedders)
impl LineSink for mpsc::UnboundedSender<String> {
    fn line(&mut self, _source: PipeSource, line: String) {
        let _ = self.send(line);
    }
}

/// Classification of a drained line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Prefixed output from one of the supervised services
    Service,
    /// Anything else: the daemon itself, unrelated activated services, raw prints
    Chatter,
}

/// Sorts lines into service output and anonymous chatter
#[derive(Debug, Clone)]
pub struct LineClassifier {
    prefix: String,
}

impl LineClassifier {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn classify(&self, line: &str) -> LineClass {
        if line.starts_with(&self.prefix) {
            LineClass::Service
        } else {
            LineClass::Chatter
        }
    }
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_LINE_PREFIX)
    }
}

/// Bounded buffer holding the most recent lines of a stream
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// The buffered lines joined with newlines
    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_CAPACITY)
    }
}

/// Sink that logs every line on the bus target
///
/// Service lines are logged at `info`, chatter at `debug`. Stderr lines are
/// also recorded in an optional [`OutputTail`].
pub struct LogSink {
    classifier: LineClassifier,
    tail: Option<OutputTail>,
}

impl LogSink {
    pub fn new(classifier: LineClassifier) -> Self {
        Self {
            classifier,
            tail: None,
        }
    }

    pub fn with_tail(mut self, tail: OutputTail) -> Self {
        self.tail = Some(tail);
        self
    }
}

impl LineSink for LogSink {
    fn line(&mut self, source: PipeSource, line: String) {
        if source == PipeSource::Stderr {
            if let Some(tail) = &self.tail {
                tail.push(&line);
            }
        }
        match self.classifier.classify(&line) {
            LineClass::Service => info!(target: BUS_TARGET, "{}", line),
            LineClass::Chatter => debug!(target: BUS_TARGET, "{}", line),
        }
    }
}

/// Decode a raw line, replacing invalid UTF-8 and dropping the line terminator
pub fn decode_line(raw: &[u8]) -> String {
    let trimmed = raw
        .strip_suffix(b"\n")
        .map(|r| r.strip_suffix(b"\r").unwrap_or(r))
        .unwrap_or(raw);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// Read one line, tolerating undecodable bytes
///
/// At most [`MAX_LINE_BYTES`] are read; the rest of a longer line arrives
/// with the next call. Returns `Ok(None)` at end-of-stream.
pub async fn read_line_lossy<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let read = reader
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(decode_line(&raw)))
}

/// Drain a stream into a sink until end-of-stream, returning the line count
pub async fn drain<R, S>(mut reader: BufReader<R>, source: PipeSource, mut sink: S) -> usize
where
    R: AsyncRead + Unpin,
    S: LineSink,
{
    let mut count = 0usize;

    loop {
        match read_line_lossy(&mut reader).await {
            Ok(Some(line)) => {
                count += 1;
                sink.line(source, line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading daemon {}: {}", source.as_str(), e);
                break;
            }
        }
    }

    // Dropping the reader here closes our end of the pipe.
    debug!("{} drainer finished after {} lines", source.as_str(), count);
    count
}

/// Spawn a drainer task for one stream
pub fn spawn_drainer<R, S>(reader: BufReader<R>, source: PipeSource, sink: S) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: LineSink,
{
    tokio::spawn(drain(reader, source, sink))
}
