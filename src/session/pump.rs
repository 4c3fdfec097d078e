//! Non-blocking access to the interpreter's output pipes.
//!
//! Each pipe gets a dedicated reader thread that does blocking reads and
//! forwards chunks over an unbounded channel. The drain loop only ever calls
//! [`StreamPump::try_read`], which never blocks, so a full stderr pipe can
//! not stall stdout (or the reverse).

use std::fmt;
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::frame::find;

/// Size of a single pipe read.
const CHUNK_SIZE: usize = 8 * 1024;

/// Which output pipe of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a non-blocking read attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TryRead {
    Data(Vec<u8>),
    /// Nothing buffered right now; try the other stream.
    WouldBlock,
    /// The pipe hit EOF (or failed) and every chunk has been delivered.
    Closed,
}

/// Reader thread plus the receiving end of its chunk channel.
pub(crate) struct StreamPump {
    stream: Stream,
    rx: Receiver<Vec<u8>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamPump {
    pub fn spawn<R>(stream: Stream, reader: R) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let handle = thread::Builder::new()
            .name(format!("tclpipe-{stream}"))
            .spawn(move || pump_loop(stream, reader, tx))?;

        Ok(Self {
            stream,
            rx,
            handle: Some(handle),
        })
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn try_read(&self) -> TryRead {
        match self.rx.try_recv() {
            Ok(chunk) => TryRead::Data(chunk),
            Err(TryRecvError::Empty) => TryRead::WouldBlock,
            Err(TryRecvError::Disconnected) => TryRead::Closed,
        }
    }

    /// Drop everything already buffered. Returns the number of bytes lost.
    pub fn discard_pending(&self) -> usize {
        let mut dropped = 0;
        while let Ok(chunk) = self.rx.try_recv() {
            dropped += chunk.len();
        }
        dropped
    }

    /// Wait briefly for the reader thread to finish, then detach it.
    ///
    /// The thread exits once the pipe closes. A grandchild that inherited
    /// the pipe can keep it open, so this never waits unconditionally.
    pub fn join(mut self, grace: Duration) {
        const CHECK_INTERVAL: Duration = Duration::from_millis(5);

        let Some(handle) = self.handle.take() else {
            return;
        };
        let checks = (grace.as_millis() / CHECK_INTERVAL.as_millis()).max(1);

        for _ in 0..checks {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(stream = %self.stream, "pipe reader thread panicked");
                }
                return;
            }
            thread::sleep(CHECK_INTERVAL);
        }

        debug!(
            stream = %self.stream,
            "pipe still open after {}ms, detaching reader thread",
            grace.as_millis()
        );
    }
}

fn pump_loop<R: Read>(stream: Stream, mut reader: R, tx: Sender<Vec<u8>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!(%stream, "pipe reached EOF");
                return;
            }
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    // Session dropped the receiver
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(%stream, "pipe read failed: {}", e);
                return;
            }
        }
    }
}

/// Accumulates one stream's bytes until its end marker arrives.
///
/// Bytes after the end marker belong to no frame; they are kept as overflow
/// and become the prefix of the next frame's buffer, where they sit before
/// the start marker and are dropped when the markers are stripped.
pub(crate) struct Accumulator {
    end_marker: Vec<u8>,
    buf: Vec<u8>,
    overflow: Vec<u8>,
    done: bool,
}

impl Accumulator {
    pub fn new(end_marker: &str, carried: Vec<u8>) -> Self {
        let mut acc = Self {
            end_marker: end_marker.as_bytes().to_vec(),
            buf: Vec::new(),
            overflow: Vec::new(),
            done: false,
        };
        if !carried.is_empty() {
            acc.push(&carried);
        }
        acc
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.done {
            self.overflow.extend_from_slice(chunk);
            return;
        }

        // Only the new bytes (plus a marker-sized overlap) can hold a first
        // occurrence of the marker.
        let search_from = self
            .buf
            .len()
            .saturating_sub(self.end_marker.len().saturating_sub(1));
        self.buf.extend_from_slice(chunk);

        if let Some(pos) = find(&self.buf[search_from..], &self.end_marker) {
            let end = search_from + pos + self.end_marker.len();
            self.overflow = self.buf.split_off(end);
            self.done = true;
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume into (frame bytes, overflow bytes).
    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.buf, self.overflow)
    }
}
