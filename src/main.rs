//! tclpipe - evaluate lines of Tcl read from stdin in a long-lived
//! interpreter subprocess.
//!
//! Results go to stdout, command errors and logs to stderr.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tclpipe::{Outcome, Session, SessionConfig, SessionError};

/// Exit status used when Ctrl-C arrives with no command in flight.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "tclpipe", version)]
#[command(about = "Evaluate Tcl commands from stdin in a persistent interpreter")]
struct Args {
    /// Interpreter executable (default: tclsh, or from config)
    executable: Option<String>,

    /// Arguments passed to the interpreter
    #[arg(last = true)]
    args: Vec<String>,

    /// JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Grace period for the interpreter to exit before it is killed
    #[arg(long, value_name = "MS")]
    stop_timeout_ms: Option<u64>,

    /// Abort (and restart the interpreter) when a command runs longer
    #[arg(long, value_name = "MS")]
    eval_timeout_ms: Option<u64>,

    /// Print each result as a JSON array of list elements
    #[arg(long, conflicts_with = "nested")]
    list: bool,

    /// Print each result as a nested JSON list
    #[arg(long)]
    nested: bool,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = SessionConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(executable) = &self.executable {
            config.executable = executable.clone();
            config.args = self.args.clone();
        } else if !self.args.is_empty() {
            config.args = self.args.clone();
        }
        if let Some(ms) = self.stop_timeout_ms {
            config = config.with_stop_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.eval_timeout_ms {
            config = config.with_eval_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }

    fn render(&self) -> Render {
        if self.list {
            Render::List
        } else if self.nested {
            Render::Nested
        } else {
            Render::Text
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Render {
    Text,
    List,
    Nested,
}

/// What the input loop does after one line.
enum Next {
    Continue,
    Restart,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries command results, so logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tclpipe=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let config = args.session_config()?;
    let render = args.render();

    let mut session = Session::new(config);
    session
        .start()
        .with_context(|| format!("Failed to start {}", session.config().command_line()))?;

    install_interrupt_handler(&session)?;
    let cancel = session.cancel_handle();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        // Drop a request left over from the previous line before this one
        // becomes cancellable
        cancel.reset();
        IN_FLIGHT.store(true, Ordering::SeqCst);
        let next = run_line(&mut session, command, render);
        IN_FLIGHT.store(false, Ordering::SeqCst);

        if let Next::Restart = next? {
            restart(&mut session)?;
        }
    }

    if session.is_running() {
        session.stop().context("Failed to stop interpreter")?;
    }
    Ok(())
}

static IN_FLIGHT: AtomicBool = AtomicBool::new(false);

/// Ctrl-C cancels the in-flight command; with nothing in flight it exits.
fn install_interrupt_handler(session: &Session) -> Result<()> {
    let cancel = session.cancel_handle();

    ctrlc::set_handler(move || {
        if IN_FLIGHT.load(Ordering::SeqCst) {
            cancel.cancel();
        } else {
            // The interpreter shares our process group and gets the same
            // SIGINT, so nothing is left behind.
            info!("Interrupted, exiting");
            std::process::exit(EXIT_INTERRUPTED);
        }
    })
    .context("Failed to install Ctrl-C handler")
}

fn run_line(session: &mut Session, command: &str, render: Render) -> Result<Next> {
    let printed = match render {
        Render::Text => session.eval(command).map(|o| o.map(Printable::Text)),
        Render::List => session
            .eval_list(command)
            .map(|o| o.map(|items| Printable::Json(serde_json::json!(items)))),
        Render::Nested => session
            .eval_nested(command, None)
            .map(|o| o.map(|value| Printable::Json(serde_json::json!(value)))),
    };

    match printed {
        Ok(Outcome::Success(result)) => {
            result.print()?;
            Ok(Next::Continue)
        }
        Ok(Outcome::Failure { message, .. }) => {
            eprintln!("error: {message}");
            Ok(Next::Continue)
        }
        Ok(Outcome::ProtocolViolation { reason }) => {
            warn!("Protocol violation, restarting interpreter: {}", reason);
            Ok(Next::Restart)
        }
        Err(e @ SessionError::MalformedList(_)) => {
            eprintln!("error: {e}");
            Ok(Next::Continue)
        }
        Err(e) if e.is_fatal() => {
            eprintln!("error: {e}");
            Ok(Next::Restart)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to evaluate {command:?}")),
    }
}

/// Bring the interpreter back after a fatal error or a poisoned session.
fn restart(session: &mut Session) -> Result<()> {
    if session.is_running() {
        if let Err(e) = session.stop() {
            warn!("Error stopping interpreter before restart: {}", e);
        }
    }
    info!("Restarting interpreter");
    session
        .start()
        .with_context(|| format!("Failed to restart {}", session.config().command_line()))
}

enum Printable {
    Text(String),
    Json(serde_json::Value),
}

impl Printable {
    fn print(self) -> Result<()> {
        let mut stdout = io::stdout().lock();
        match self {
            Printable::Text(text) if text.is_empty() => {}
            Printable::Text(text) => {
                stdout.write_all(text.as_bytes())?;
                if !text.ends_with('\n') {
                    stdout.write_all(b"\n")?;
                }
            }
            Printable::Json(value) => {
                serde_json::to_writer(&mut stdout, &value)?;
                stdout.write_all(b"\n")?;
            }
        }
        stdout.flush()?;
        Ok(())
    }
}
