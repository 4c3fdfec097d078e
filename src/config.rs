//! Session configuration.
//!
//! Resolution order (later wins):
//!
//! 1. Built-in defaults (`tclsh`, no arguments, 1s stop timeout)
//! 2. JSON file: explicit path, else `$TCLPIPE_CONFIG`, else
//!    `<config_dir>/tclpipe/config.json` if it exists
//! 3. `TCLPIPE_EXECUTABLE` environment variable
//! 4. Whatever the caller sets afterwards (e.g. CLI flags)
//!
//! ```json
//! {
//!   "executable": "gtkwave",
//!   "args": ["-W"],
//!   "stop_timeout_ms": 2000,
//!   "eval_timeout_ms": 30000
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::session::MIN_MARKER_LEN;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TCLPIPE_CONFIG";

/// Environment variable overriding the interpreter executable.
pub const EXECUTABLE_ENV: &str = "TCLPIPE_EXECUTABLE";

const DEFAULT_EXECUTABLE: &str = "tclsh";
const DEFAULT_STOP_TIMEOUT_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How to launch the interpreter and how long to wait on it.
///
/// Identity of a session is `(executable, args)`; the remaining fields only
/// tune timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interpreter executable, resolved through `PATH`.
    pub executable: String,
    pub args: Vec<String>,
    /// Grace period for the interpreter to honor `exit` before it is killed.
    pub stop_timeout_ms: u64,
    /// Sleep between drain polls that found no data.
    pub poll_interval_ms: u64,
    /// Upper bound on a single eval; `None` waits indefinitely.
    pub eval_timeout_ms: Option<u64>,
    /// Marker token length, never below 16.
    pub marker_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            args: Vec::new(),
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            eval_timeout_ms: None,
            marker_len: MIN_MARKER_LEN,
        }
    }
}

impl SessionConfig {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn eval_timeout(&self) -> Option<Duration> {
        self.eval_timeout_ms.map(Duration::from_millis)
    }

    pub fn marker_len(&self) -> usize {
        self.marker_len.max(MIN_MARKER_LEN)
    }

    /// `executable arg1 arg2 ...`, for log and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn from_json_str(json: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json, path)
    }

    /// Load defaults, the config file and environment overrides.
    ///
    /// An explicit path (argument or `$TCLPIPE_CONFIG`) must exist; the
    /// per-user default file is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        Self::load_with(explicit, default_config_path(), env)
    }

    fn load_with<F>(
        explicit: Option<&Path>,
        user_default: Option<PathBuf>,
        env: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| env(CONFIG_ENV).map(PathBuf::from));

        let mut config = match (explicit, user_default) {
            (Some(path), _) => Self::from_file(&path)?,
            (None, Some(path)) if path.is_file() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        config.apply_env(env);
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(executable) = env(EXECUTABLE_ENV).filter(|value| !value.trim().is_empty()) {
            debug!("Using interpreter from {}: {}", EXECUTABLE_ENV, executable);
            self.executable = executable;
        }
    }
}

/// `<config_dir>/tclpipe/config.json` (XDG on Linux, Library on macOS).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tclpipe").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn temp_config(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tclpipe-config-{}-{}.json",
            name,
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.executable, "tclsh");
        assert!(config.args.is_empty());
        assert_eq!(config.stop_timeout(), Duration::from_secs(1));
        assert_eq!(config.eval_timeout(), None);
        assert_eq!(config.marker_len(), 16);
    }

    #[test]
    fn test_builder() {
        let config = SessionConfig::new("gtkwave")
            .with_args(["-W"])
            .with_stop_timeout(Duration::from_millis(250))
            .with_eval_timeout(Duration::from_secs(3));
        assert_eq!(config.command_line(), "gtkwave -W");
        assert_eq!(config.stop_timeout_ms, 250);
        assert_eq!(config.eval_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_marker_len_is_clamped() {
        let config = SessionConfig {
            marker_len: 4,
            ..SessionConfig::default()
        };
        assert_eq!(config.marker_len(), MIN_MARKER_LEN);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SessionConfig::from_json_str(r#"{"executable": "wish"}"#, Path::new("inline")).unwrap();
        assert_eq!(config.executable, "wish");
        assert_eq!(config.stop_timeout_ms, 1000);
        assert_eq!(config.poll_interval_ms, 1);
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let err = SessionConfig::from_json_str("{not json", Path::new("/etc/tclpipe.json"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("/etc/tclpipe.json"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let missing = Path::new("/nonexistent/tclpipe/config.json");
        let err = SessionConfig::load_with(Some(missing), None, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_missing_user_default_is_ignored() {
        let config = SessionConfig::load_with(
            None,
            Some(PathBuf::from("/nonexistent/tclpipe/config.json")),
            no_env,
        )
        .unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let path = temp_config("env", r#"{"executable": "wish", "args": ["-x"]}"#);
        let vars: HashMap<&str, String> = [
            (CONFIG_ENV, path.display().to_string()),
            (EXECUTABLE_ENV, "bluetcl".to_string()),
        ]
        .into_iter()
        .collect();

        let config = SessionConfig::load_with(None, None, |key| vars.get(key).cloned()).unwrap();
        assert_eq!(config.executable, "bluetcl");
        assert_eq!(config.args, vec!["-x"]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_blank_env_executable_is_ignored() {
        let mut config = SessionConfig::default();
        config.apply_env(|key| (key == EXECUTABLE_ENV).then(|| "  ".to_string()));
        assert_eq!(config.executable, "tclsh");
    }
}
