//! Interpreter session: process lifecycle and the eval protocol.
//!
//! A [`Session`] owns one interpreter child process and its three standard
//! streams. `eval` writes a framed script to stdin, drains stdout and stderr
//! independently until both end markers arrive, then classifies the result.
//!
//! At most one eval is in flight at a time; `eval` takes `&mut self`.

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::{self, ListError, Value};
use crate::config::SessionConfig;

use super::frame::Frame;
use super::outcome::Outcome;
use super::pump::{Accumulator, Stream, StreamPump, TryRead};

/// Out-of-band directive written by [`Session::stop`].
const EXIT_DIRECTIVE: &[u8] = b"exit\n";

/// Poll interval while waiting for the interpreter to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for pipe reader threads after the child is reaped.
const READER_JOIN_GRACE: Duration = Duration::from_millis(100);

/// How long a closed pipe may precede the child's exit status.
const CLOSED_PIPE_GRACE: Duration = Duration::from_millis(500);

/// Session errors.
///
/// `CommandFailed` and `ProtocolViolation` are only produced by
/// [`Outcome::into_result`]; `eval` itself returns them as [`Outcome`]
/// variants.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Interpreter already running")]
    AlreadyRunning,

    #[error("No interpreter running")]
    NotRunning,

    #[error("Failed to spawn interpreter `{executable}`: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The child exited mid-protocol. Fatal to the session; `stop()` it.
    #[error("Interpreter exited unexpectedly ({})", describe_exit(*.code))]
    ProcessDied { code: Option<i32> },

    /// A pipe closed while the child stayed alive.
    #[error("Interpreter closed its {stream} while a command was in flight")]
    StreamClosed { stream: Stream },

    /// Cancelled during the drain. The session has been stopped.
    #[error("Interrupted while executing {command:?} (stdout so far: {stdout:?}, stderr so far: {stderr:?})")]
    Interrupted {
        command: String,
        stdout: String,
        stderr: String,
    },

    /// The eval timeout expired. The session has been stopped.
    #[error("Command {command:?} did not complete within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Command {command:?} failed: {message:?}{}", format_diagnostics(.diagnostics))]
    CommandFailed {
        command: String,
        message: String,
        diagnostics: String,
    },

    #[error("Protocol violation while executing {command:?}: {reason}")]
    ProtocolViolation { command: String, reason: String },

    #[error("Command result is not a well-formed list: {0}")]
    MalformedList(#[from] ListError),
}

impl SessionError {
    /// Whether the session can no longer serve evals without a restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::ProcessDied { .. }
                | SessionError::StreamClosed { .. }
                | SessionError::Interrupted { .. }
                | SessionError::Timeout { .. }
                | SessionError::Io(_)
        )
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn format_diagnostics(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!(" (stderr: {diagnostics:?})")
    }
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running,
    Stopped,
}

/// Cancels an in-flight eval from another thread.
///
/// Cancellation poisons the session: partially drained marker state cannot
/// be resynchronized, so the interpreter is killed and the session stops.
///
/// A request made before an eval starts applies to that eval. The flag is
/// cleared once an eval's drain ends, whatever its result.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Withdraw a pending request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The live child and its pipes.
struct Interpreter {
    child: Child,
    stdin: ChildStdin,
    stdout: StreamPump,
    stderr: StreamPump,
    /// Bytes that arrived after the previous frame's end marker.
    stdout_residue: Vec<u8>,
    stderr_residue: Vec<u8>,
}

enum State {
    NotStarted,
    Running(Interpreter),
    Stopped,
}

/// What stopped a drain before both end markers arrived.
enum DrainAbort {
    Cancelled,
    TimedOut(Duration),
    Error(SessionError),
}

/// One interpreter subprocess driven through framed evals.
///
/// # Example
///
/// ```ignore
/// use tclpipe::{Session, SessionConfig};
///
/// let mut tcl = Session::new(SessionConfig::default());
/// tcl.start()?;
/// let sum = tcl.eval("expr {3 + 7}")?.into_result("expr {3 + 7}")?;
/// assert_eq!(sum, "10");
/// tcl.stop()?;
/// ```
///
/// Dropping a running session stops it.
pub struct Session {
    config: SessionConfig,
    state: State,
    last_diagnostics: Option<String>,
    cancel: CancelHandle,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: State::NotStarted,
            last_diagnostics: None,
            cancel: CancelHandle::default(),
        }
    }

    /// Start a session, run `f` with it, and stop it on every exit path.
    ///
    /// The interpreter is stopped before an error from `f` is returned, and
    /// on unwind through `Drop`. An error from `f` takes precedence over an
    /// error from stopping.
    pub fn scoped<T, E, F>(config: SessionConfig, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Session) -> Result<T, E>,
        E: From<SessionError>,
    {
        let mut session = Session::new(config);
        session.start()?;

        let result = f(&mut session);
        let stopped = if session.is_running() {
            session.stop()
        } else {
            Ok(())
        };

        match (result, stopped) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e.into()),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            State::NotStarted => SessionState::NotStarted,
            State::Running(_) => SessionState::Running,
            State::Stopped => SessionState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// OS process id of the interpreter, while running.
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            State::Running(interp) => Some(interp.child.id()),
            _ => None,
        }
    }

    /// Stderr text recorded by the most recent eval, start/end markers
    /// removed. After a failure it still holds the delimited error message.
    pub fn last_diagnostics(&self) -> Option<&str> {
        self.last_diagnostics.as_deref()
    }

    /// Handle for cancelling the in-flight eval from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Spawn the interpreter with all three standard streams piped.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }

        info!("Starting interpreter: {}", self.config.command_line());

        let mut child = Command::new(&self.config.executable)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SessionError::Spawn {
                executable: self.config.executable.clone(),
                source,
            })?;

        let interp = match attach_pipes(&mut child) {
            Ok((stdin, stdout, stderr)) => Interpreter {
                child,
                stdin,
                stdout,
                stderr,
                stdout_residue: Vec::new(),
                stderr_residue: Vec::new(),
            },
            Err(e) => {
                // Never leave an unowned child behind
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        debug!(pid = interp.child.id(), "Interpreter started");
        self.state = State::Running(interp);
        Ok(())
    }

    /// Ask the interpreter to exit, kill it after the stop timeout, and reap
    /// it in either case.
    ///
    /// The session is `Stopped` afterwards even when an error is returned.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let interp = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(interp) => interp,
            other => {
                self.state = other;
                return Err(SessionError::NotRunning);
            }
        };

        let status = interp.shutdown(self.config.stop_timeout())?;
        info!("Interpreter stopped ({})", describe_exit(status.code()));
        Ok(())
    }

    /// Evaluate `command` and return its result text.
    ///
    /// Multi-command scripts are allowed; the result is whatever the script
    /// printed to stdout followed by the value of its last command.
    pub fn eval(&mut self, command: &str) -> Result<Outcome, SessionError> {
        let interp = match &mut self.state {
            State::Running(interp) => interp,
            _ => return Err(SessionError::NotRunning),
        };

        let frame = Frame::new(command, self.config.marker_len());
        debug!(command, "Evaluating");

        if let Err(e) = interp.send(&frame) {
            return Err(interp.diagnose_write_failure(e));
        }

        let deadline = self.config.eval_timeout().map(|after| (Instant::now() + after, after));
        let drained = interp.drain(&frame, &self.cancel, self.config.poll_interval(), deadline);
        self.cancel.reset();

        let (stdout_raw, stderr_raw) = match drained {
            Ok(buffers) => buffers,
            Err(DrainAbort::Error(e)) => {
                error!(command, "Eval aborted: {}", e);
                return Err(e);
            }
            Err(DrainAbort::Cancelled) => {
                let (stdout, stderr) = interp.partial_buffers();
                warn!(
                    command,
                    stdout = %stdout,
                    stderr = %stderr,
                    "Eval interrupted; killing interpreter"
                );
                self.poison();
                return Err(SessionError::Interrupted {
                    command: command.to_string(),
                    stdout,
                    stderr,
                });
            }
            Err(DrainAbort::TimedOut(after)) => {
                warn!(command, "Eval timed out after {:?}; killing interpreter", after);
                self.poison();
                return Err(SessionError::Timeout {
                    command: command.to_string(),
                    after,
                });
            }
        };

        debug!(
            stdout = stdout_raw.len(),
            stderr = stderr_raw.len(),
            "Drained both streams"
        );
        let outcome = self.conclude(&frame, &stdout_raw, &stderr_raw);
        Ok(outcome)
    }

    /// [`eval`](Self::eval), then split the result as a flat list.
    pub fn eval_list(&mut self, command: &str) -> Result<Outcome<Vec<String>>, SessionError> {
        Ok(self.eval(command)?.try_map(|text| codec::parse_list(&text))?)
    }

    /// [`eval`](Self::eval), then split the result recursively; see
    /// [`codec::parse_nested`].
    pub fn eval_nested(
        &mut self,
        command: &str,
        levels: Option<usize>,
    ) -> Result<Outcome<Value>, SessionError> {
        Ok(self
            .eval(command)?
            .try_map(|text| codec::parse_nested(&text, levels))?)
    }

    /// Strip markers, record diagnostics, classify and report.
    fn conclude(&mut self, frame: &Frame, stdout_raw: &[u8], stderr_raw: &[u8]) -> Outcome {
        let command = frame.command();
        let stripped = frame
            .strip_stdout(stdout_raw)
            .and_then(|out| frame.strip_stderr(stderr_raw).map(|err| (out, err)));

        let (stdout, stderr) = match stripped {
            Ok(pair) => pair,
            Err(reason) => {
                error!(command, "Protocol violation: {}", reason);
                self.last_diagnostics = Some(String::from_utf8_lossy(stderr_raw).into_owned());
                return Outcome::ProtocolViolation { reason };
            }
        };

        if stdout.discarded > 0 || stderr.discarded > 0 {
            debug!(
                stdout = stdout.discarded,
                stderr = stderr.discarded,
                "Dropped bytes preceding the start markers"
            );
        }

        let outcome = frame.classify(stdout.text, &stderr.text);
        match &outcome {
            Outcome::Success(_) if !stderr.text.is_empty() => {
                warn!(command, "Command wrote to stderr: {:?}", stderr.text);
            }
            Outcome::Failure {
                message,
                diagnostics,
            } => {
                if !diagnostics.is_empty() {
                    warn!(command, "Command wrote to stderr: {:?}", diagnostics);
                }
                debug!(command, "Command failed: {}", message);
            }
            Outcome::ProtocolViolation { reason } => {
                error!(command, "Protocol violation: {}", reason);
            }
            Outcome::Success(_) => {}
        }

        self.last_diagnostics = Some(stderr.text);
        outcome
    }

    /// Kill and reap after an aborted drain. The session ends `Stopped`.
    fn poison(&mut self) {
        if let State::Running(interp) = std::mem::replace(&mut self.state, State::Stopped) {
            if let Err(e) = interp.kill() {
                error!("Failed to reap interpreter after abort: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("Session dropped while running; stopping interpreter");
            if let Err(e) = self.stop() {
                warn!("Error stopping interpreter on drop: {}", e);
            }
        }
    }
}

fn attach_pipes(child: &mut Child) -> io::Result<(ChildStdin, StreamPump, StreamPump)> {
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let stdout = StreamPump::spawn(Stream::Stdout, stdout)?;
    let stderr = StreamPump::spawn(Stream::Stderr, stderr)?;
    Ok((stdin, stdout, stderr))
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::other(format!("Failed to get {name} handle for interpreter"))
}

impl Interpreter {
    /// Write the whole framed script in one go.
    fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.stdin.write_all(frame.script().as_bytes())?;
        self.stdin.flush()
    }

    /// A failed stdin write usually means the child is gone.
    fn diagnose_write_failure(&mut self, e: io::Error) -> SessionError {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                error!("Interpreter exited before accepting the command ({})", describe_exit(status.code()));
                SessionError::ProcessDied {
                    code: status.code(),
                }
            }
            _ => SessionError::Io(e),
        }
    }

    /// Poll both pipes until each buffer ends with its end marker.
    ///
    /// Neither pipe is ever waited on exclusively: an empty pipe is skipped
    /// and the other one tried, and the loop sleeps only when both were
    /// empty.
    fn drain(
        &mut self,
        frame: &Frame,
        cancel: &CancelHandle,
        poll_interval: Duration,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(Vec<u8>, Vec<u8>), DrainAbort> {
        let mut stdout = Accumulator::new(frame.stdout_end(), std::mem::take(&mut self.stdout_residue));
        let mut stderr = Accumulator::new(frame.stderr_end(), std::mem::take(&mut self.stderr_residue));
        let mut closed_since: Option<(Stream, Instant)> = None;

        while !(stdout.is_done() && stderr.is_done()) {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    return Err(DrainAbort::Error(SessionError::ProcessDied {
                        code: status.code(),
                    }))
                }
                Ok(None) => {}
                Err(e) => return Err(DrainAbort::Error(e.into())),
            }

            if cancel.is_cancelled() {
                self.stash_partial(stdout, stderr);
                return Err(DrainAbort::Cancelled);
            }
            if let Some((at, after)) = deadline {
                if Instant::now() >= at {
                    self.stash_partial(stdout, stderr);
                    return Err(DrainAbort::TimedOut(after));
                }
            }

            let mut progressed = false;
            for (acc, pump) in [(&mut stdout, &self.stdout), (&mut stderr, &self.stderr)] {
                if acc.is_done() {
                    continue;
                }
                match pump.try_read() {
                    TryRead::Data(chunk) => {
                        acc.push(&chunk);
                        progressed = true;
                    }
                    TryRead::WouldBlock => {}
                    TryRead::Closed => {
                        let (stream, since) =
                            *closed_since.get_or_insert((pump.stream(), Instant::now()));
                        // Give the exit status a chance to show up before
                        // blaming the pipe.
                        if since.elapsed() > CLOSED_PIPE_GRACE {
                            return Err(DrainAbort::Error(SessionError::StreamClosed { stream }));
                        }
                    }
                }
            }

            if !progressed {
                if poll_interval.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(poll_interval);
                }
            }
        }

        let (stdout, stdout_overflow) = stdout.finish();
        let (stderr, stderr_overflow) = stderr.finish();
        self.stdout_residue = stdout_overflow;
        self.stderr_residue = stderr_overflow;
        Ok((stdout, stderr))
    }

    /// Keep partially drained bytes so an abort can report them.
    fn stash_partial(&mut self, stdout: Accumulator, stderr: Accumulator) {
        self.stdout_residue = stdout.finish().0;
        self.stderr_residue = stderr.finish().0;
    }

    fn partial_buffers(&self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout_residue).into_owned(),
            String::from_utf8_lossy(&self.stderr_residue).into_owned(),
        )
    }

    /// Graceful shutdown: `exit` on raw stdin, close stdin, wait up to
    /// `timeout`, then kill. The child is always reaped before returning.
    fn shutdown(self, timeout: Duration) -> Result<ExitStatus, SessionError> {
        let Interpreter {
            mut child,
            mut stdin,
            stdout,
            stderr,
            ..
        } = self;

        // A framed eval of `exit` would kill the child mid-response, so the
        // directive bypasses the framing.
        if let Err(e) = stdin.write_all(EXIT_DIRECTIVE).and_then(|_| stdin.flush()) {
            debug!("Could not send exit directive: {}", e);
        }
        drop(stdin);

        let status = match wait_with_deadline(&mut child, timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(
                    pid = child.id(),
                    "Interpreter did not exit within {:?}; killing", timeout
                );
                force_reap(&mut child)?
            }
            Err(e) => {
                warn!(pid = child.id(), "Waiting for interpreter failed: {}; killing", e);
                force_reap(&mut child)?
            }
        };

        stdout.join(READER_JOIN_GRACE);
        stderr.join(READER_JOIN_GRACE);
        Ok(status)
    }

    /// Immediate kill, used after an aborted eval.
    fn kill(self) -> Result<ExitStatus, SessionError> {
        let Interpreter {
            mut child,
            stdin,
            stdout,
            stderr,
            ..
        } = self;
        drop(stdin);

        let status = force_reap(&mut child)?;
        let dropped = stdout.discard_pending() + stderr.discard_pending();
        if dropped > 0 {
            debug!(bytes = dropped, "Discarded undelivered interpreter output");
        }
        stdout.join(READER_JOIN_GRACE);
        stderr.join(READER_JOIN_GRACE);
        Ok(status)
    }
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Kill and wait unconditionally; never leaves a defunct child.
fn force_reap(child: &mut Child) -> Result<ExitStatus, SessionError> {
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill
        debug!("Kill failed: {}", e);
    }
    Ok(child.wait()?)
}
