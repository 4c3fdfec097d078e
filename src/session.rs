//! Interpreter sessions.
//!
//! - `client` - [`Session`] lifecycle, eval and error types
//! - `frame` - marker tokens, the wrapper script, stripping and classification
//! - `pump` - per-pipe reader threads and end-marker accumulation
//! - `outcome` - [`Outcome`] of a single eval

mod client;
mod frame;
mod outcome;
mod pump;

pub use client::{CancelHandle, Session, SessionError, SessionState};
pub use frame::{marker, Frame, Stripped, MIN_MARKER_LEN};
pub use outcome::Outcome;
pub use pump::Stream;
