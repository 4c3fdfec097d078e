//! tclpipe: drive a Tcl interpreter subprocess from Rust.
//!
//! - `session` - start/stop an interpreter and evaluate commands over its
//!   standard streams, with errors and diagnostics kept apart
//! - `codec` - Tcl list text to and from Rust values
//! - `config` - how the interpreter is launched, from defaults, JSON and env
//!
//! ```ignore
//! use tclpipe::{codec, Session, SessionConfig, SessionError};
//!
//! let primes = Session::scoped(SessionConfig::default(), |tcl| {
//!     tcl.eval("set primes {2 3 5 7}")?;
//!     let items = tcl.eval_list("set primes")?.into_result("set primes")?;
//!     Ok::<_, SessionError>(items)
//! })?;
//! assert_eq!(codec::format_list(&primes), "2 3 5 7");
//! ```

pub mod codec;
pub mod config;
pub mod session;

pub use codec::{ListError, Value};
pub use config::{ConfigError, SessionConfig};
pub use session::{CancelHandle, Outcome, Session, SessionError, SessionState};
