//! Daemon configuration.
//!
//! # Environment Variables
//!
//! - `MOLT_DAEMONIZE`: detach into the background (`1`/`true`). Default: off
//! - `MOLT_PID_FILE`: PID file path. Default: `molt.pid`
//! - `MOLT_WORK_DIR`: working directory of the final process. Default: `/`
//! - `MOLT_HAMMER_TIMEOUT_SECS`: grace window before a forced exit. Default: 10

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

/// Forced-exit delay used when nothing else is configured.
pub const DEFAULT_HAMMER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Detach with a second re-exec and a new session.
    pub daemonize: bool,
    pub pid_file: PathBuf,
    pub work_dir: PathBuf,
    pub hammer_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemonize: false,
            pid_file: PathBuf::from("molt.pid"),
            work_dir: PathBuf::from("/"),
            hammer_timeout_secs: DEFAULT_HAMMER_TIMEOUT.as_secs(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `MOLT_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let daemonize = std::env::var("MOLT_DAEMONIZE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(defaults.daemonize);

        let pid_file = std::env::var_os("MOLT_PID_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.pid_file);

        let work_dir = std::env::var_os("MOLT_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let hammer_timeout_secs = std::env::var("MOLT_HAMMER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.hammer_timeout_secs);

        Self {
            daemonize,
            pid_file,
            work_dir,
            hammer_timeout_secs,
        }
    }

    pub fn hammer_timeout(&self) -> Duration {
        Duration::from_secs(self.hammer_timeout_secs)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            daemonize = self.daemonize,
            pid_file = %self.pid_file.display(),
            work_dir = %self.work_dir.display(),
            hammer_timeout_secs = self.hammer_timeout_secs,
            "Daemon configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert!(!config.daemonize);
        assert_eq!(config.hammer_timeout(), Duration::from_secs(10));
        assert_eq!(config.work_dir, PathBuf::from("/"));
    }

    #[test]
    fn test_from_env_default() {
        std::env::remove_var("MOLT_DAEMONIZE");
        std::env::remove_var("MOLT_PID_FILE");
        std::env::remove_var("MOLT_WORK_DIR");
        std::env::remove_var("MOLT_HAMMER_TIMEOUT_SECS");
        assert_eq!(DaemonConfig::from_env(), DaemonConfig::default());
    }
}
