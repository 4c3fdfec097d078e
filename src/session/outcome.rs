//! Result of a single eval.

use super::client::SessionError;

/// What one eval produced.
///
/// Returned rather than raised: a failing Tcl command is expected during
/// normal use and is ordinary data here. Misuse of the session and a dead
/// interpreter are reported through [`SessionError`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T = String> {
    /// The command completed; `T` is its result text (or a parse of it).
    Success(T),

    /// The interpreter raised an error for the command.
    Failure {
        /// Error message, trimmed.
        message: String,
        /// Incidental stderr text written before the failure.
        diagnostics: String,
    },

    /// The framing invariants were broken. Indicates a wrapping bug or
    /// adversarial output; never absorbed silently.
    ProtocolViolation { reason: String },
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The success value, discarding failure details.
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Failure {
                message,
                diagnostics,
            } => Outcome::Failure {
                message,
                diagnostics,
            },
            Outcome::ProtocolViolation { reason } => Outcome::ProtocolViolation { reason },
        }
    }

    /// Like [`map`](Self::map) for a fallible conversion of the success value.
    pub fn try_map<U, E, F>(self, f: F) -> Result<Outcome<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        match self {
            Outcome::Success(value) => f(value).map(Outcome::Success),
            Outcome::Failure {
                message,
                diagnostics,
            } => Ok(Outcome::Failure {
                message,
                diagnostics,
            }),
            Outcome::ProtocolViolation { reason } => Ok(Outcome::ProtocolViolation { reason }),
        }
    }

    /// Convert into a `Result`, attaching `command` to the error so callers
    /// can use `?`.
    pub fn into_result(self, command: &str) -> Result<T, SessionError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure {
                message,
                diagnostics,
            } => Err(SessionError::CommandFailed {
                command: command.to_string(),
                message,
                diagnostics,
            }),
            Outcome::ProtocolViolation { reason } => Err(SessionError::ProtocolViolation {
                command: command.to_string(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> Outcome<String> {
        Outcome::Failure {
            message: "divide by zero".to_string(),
            diagnostics: String::new(),
        }
    }

    #[test]
    fn test_map_only_touches_success() {
        assert_eq!(
            Outcome::Success("3".to_string()).map(|s| s.len()),
            Outcome::Success(1)
        );
        assert_eq!(
            failure().map(|s| s.len()),
            Outcome::Failure {
                message: "divide by zero".to_string(),
                diagnostics: String::new(),
            }
        );
    }

    #[test]
    fn test_try_map_propagates_conversion_error() {
        let parsed: Result<Outcome<i64>, _> =
            Outcome::Success("x".to_string()).try_map(|s| s.parse::<i64>());
        assert!(parsed.is_err());

        let parsed = failure().try_map(|s| s.parse::<i64>()).unwrap();
        assert!(!parsed.is_success());
    }

    #[test]
    fn test_into_result_attaches_command() {
        let err = failure().into_result("expr {1/0}").unwrap_err();
        match err {
            SessionError::CommandFailed {
                command, message, ..
            } => {
                assert_eq!(command, "expr {1/0}");
                assert_eq!(message, "divide by zero");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }

        let err = Outcome::<String>::ProtocolViolation {
            reason: "bad".to_string(),
        }
        .into_result("set x")
        .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));

        assert_eq!(
            Outcome::Success("ok".to_string()).into_result("x").unwrap(),
            "ok"
        );
    }
}
