//! Marker-token framing for one eval.
//!
//! The interpreter has no structured wire format, so each command is wrapped
//! in a script that brackets its output with freshly generated marker tokens:
//!
//! ```text
//! stdout: <out-start> [command result] <out-end>
//! stderr: <err-start> [incidental text] [<delim> error message <delim>] <err-end>
//! ```
//!
//! A clean run puts zero delimiters on stderr, a failed run exactly two. The
//! region between them is unambiguous because the error text cannot contain
//! the delimiter token itself.
//!
//! The command travels as one list-quoted word assigned to a variable and
//! is evaluated with `catch` on that variable, so its own brace balance
//! cannot alter the wrapper.
//!
//! Tokens are 16+ characters drawn from a 62-symbol alphabet, so a collision
//! with real interpreter output is negligible but not impossible. Nothing
//! checks command output for a colliding token.

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::codec::quote_word;

use super::outcome::Outcome;

/// Shortest marker token ever generated.
pub const MIN_MARKER_LEN: usize = 16;

/// Variable the wrapper script stores the caught result in.
const RESULT_VAR: &str = "::tclpipe_result";

/// Variable holding the command text for the duration of one eval.
const COMMAND_VAR: &str = "::tclpipe_command";

/// Generate a random alphanumeric marker token of at least
/// [`MIN_MARKER_LEN`] characters.
pub fn marker(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len.max(MIN_MARKER_LEN))
        .map(char::from)
        .collect()
}

/// One request/response cycle: a command plus its five marker tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: String,
    stdout_start: String,
    stdout_end: String,
    stderr_start: String,
    stderr_delimiter: String,
    stderr_end: String,
}

impl Frame {
    /// Frame `command` with fresh markers of `marker_len` characters.
    pub fn new(command: &str, marker_len: usize) -> Self {
        Self {
            command: command.to_string(),
            stdout_start: marker(marker_len),
            stdout_end: marker(marker_len),
            stderr_start: marker(marker_len),
            stderr_delimiter: marker(marker_len),
            stderr_end: marker(marker_len),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout_start(&self) -> &str {
        &self.stdout_start
    }

    pub fn stdout_end(&self) -> &str {
        &self.stdout_end
    }

    pub fn stderr_start(&self) -> &str {
        &self.stderr_start
    }

    pub fn stderr_delimiter(&self) -> &str {
        &self.stderr_delimiter
    }

    pub fn stderr_end(&self) -> &str {
        &self.stderr_end
    }

    /// The script written to the interpreter's stdin.
    ///
    /// The command runs inside `catch` at global level, so variables it sets
    /// persist across evals. The command is assigned as a literal word and
    /// never spliced into the wrapper as code, so a command with unbalanced
    /// braces behaves exactly as it would typed at the interpreter.
    ///
    /// Only catch code 1 (`TCL_ERROR`) counts as a failure; `return`,
    /// `break` and `continue` deliver their value as the result.
    pub fn script(&self) -> String {
        format!(
            "puts -nonewline stdout {out_start}\n\
             puts -nonewline stderr {err_start}\n\
             set {cmd_var} {command}\n\
             if {{[catch ${cmd_var} {var}] == 1}} {{\n\
             \x20   puts -nonewline stderr {delim}\n\
             \x20   puts -nonewline stderr ${var}\n\
             \x20   puts -nonewline stderr {delim}\n\
             }} else {{\n\
             \x20   puts -nonewline stdout ${var}\n\
             }}\n\
             puts -nonewline stdout {out_end}\n\
             puts -nonewline stderr {err_end}\n\
             flush stdout\n\
             flush stderr\n",
            out_start = self.stdout_start,
            err_start = self.stderr_start,
            cmd_var = COMMAND_VAR,
            command = quote_word(&self.command),
            var = RESULT_VAR,
            delim = self.stderr_delimiter,
            out_end = self.stdout_end,
            err_end = self.stderr_end,
        )
    }

    /// Strip the start/end markers from a drained stdout buffer.
    pub fn strip_stdout(&self, raw: &[u8]) -> Result<Stripped, String> {
        strip(raw, &self.stdout_start, &self.stdout_end, "stdout")
    }

    /// Strip the start/end markers from a drained stderr buffer.
    pub fn strip_stderr(&self, raw: &[u8]) -> Result<Stripped, String> {
        strip(raw, &self.stderr_start, &self.stderr_end, "stderr")
    }

    /// Classify stripped stdout/stderr into an [`Outcome`].
    ///
    /// The stderr text is split on the delimiter token:
    /// - one segment: clean run, stdout is the result;
    /// - three segments: the command failed, the middle segment is the error
    ///   message, anything after the closing delimiter is a violation;
    /// - anything else: violation.
    pub fn classify(&self, stdout: String, stderr: &str) -> Outcome {
        let segments: Vec<&str> = stderr.split(self.stderr_delimiter.as_str()).collect();

        match segments.as_slice() {
            [_] => Outcome::Success(stdout),
            [before, message, after] => {
                if after.is_empty() {
                    Outcome::Failure {
                        message: message.trim().to_string(),
                        diagnostics: (*before).to_string(),
                    }
                } else {
                    Outcome::ProtocolViolation {
                        reason: format!("unexpected stderr after error message: {after:?}"),
                    }
                }
            }
            _ => Outcome::ProtocolViolation {
                reason: format!(
                    "stderr contained {} delimiter markers (expected 0 or 2): {stderr:?}",
                    segments.len() - 1
                ),
            },
        }
    }
}

/// A drained buffer with its markers removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripped {
    pub text: String,
    /// Bytes that arrived before the start marker and were dropped.
    pub discarded: usize,
}

fn strip(raw: &[u8], start: &str, end: &str, stream: &str) -> Result<Stripped, String> {
    let body = raw
        .strip_suffix(end.as_bytes())
        .ok_or_else(|| format!("{stream} does not end with its end marker"))?;
    let begin = find(body, start.as_bytes())
        .ok_or_else(|| format!("{stream} start marker missing"))?;

    Ok(Stripped {
        text: String::from_utf8_lossy(&body[begin + start.len()..]).into_owned(),
        discarded: begin,
    })
}

/// Byte offset of the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
