//! moltd configuration.
//!
//! Loaded from an optional TOML file; without one, the daemon section comes
//! from `MOLT_*` environment variables and the server section from defaults.
//! Command-line flags override both.
//!
//! ```toml
//! log_file = "/var/log/moltd/moltd.log"
//!
//! [daemon]
//! daemonize = true
//! pid_file = "/run/moltd.pid"
//! work_dir = "/"
//! hammer_timeout_secs = 10
//!
//! [server]
//! listen = ["127.0.0.1:7000"]
//! access_log = "/var/log/moltd/access.log"
//! drain_timeout_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use molt::DaemonConfig;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where a detached daemon's output ends up. Without it, output of a
    /// daemonized instance is discarded.
    pub log_file: Option<PathBuf>,
    pub daemon: DaemonConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Addresses to serve on, as `ip:port`. Inherited listeners are matched
    /// against these exactly.
    pub listen: Vec<String>,
    /// Appended to once per finished connection; kept open across reloads.
    pub access_log: Option<PathBuf>,
    /// How long a shutdown waits for open connections.
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:7000".to_string()],
            access_log: None,
            drain_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))
            }
            None => Ok(Self {
                log_file: None,
                daemon: DaemonConfig::from_env(),
                server: ServerConfig::default(),
            }),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn log_config(&self) {
        self.daemon.log_config();
        info!(log_file = ?self.log_file, "Log destination");
        info!(
            listen = ?self.server.listen,
            access_log = ?self.server.access_log,
            drain_timeout_secs = self.server.drain_timeout_secs,
            "Server configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let config = Config::parse(
            r#"
            log_file = "/var/log/moltd.log"

            [daemon]
            daemonize = true
            pid_file = "/run/moltd.pid"
            hammer_timeout_secs = 3

            [server]
            listen = ["127.0.0.1:7000", "127.0.0.1:7001"]
            access_log = "/tmp/access.log"
            drain_timeout_secs = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/moltd.log")));
        assert!(config.daemon.daemonize);
        assert_eq!(config.daemon.pid_file, PathBuf::from("/run/moltd.pid"));
        assert_eq!(config.daemon.work_dir, PathBuf::from("/"));
        assert_eq!(config.daemon.hammer_timeout(), Duration::from_secs(3));
        assert_eq!(config.server.listen.len(), 2);
        assert_eq!(config.server.access_log, Some(PathBuf::from("/tmp/access.log")));
        assert_eq!(config.server.drain_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.log_file, None);
        assert_eq!(config.daemon, DaemonConfig::default());
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(Config::parse("[daemon]\ndaemonize = \"maybe\"\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
