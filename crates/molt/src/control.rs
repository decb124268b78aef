//! Operator commands against a running instance, addressed by its PID file.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::pidfile::{self, Status};
use crate::signals::{send_signal, Signal};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no running instance holds {}", .0.display())]
    NotRunning(PathBuf),

    #[error("failed to read status from {}: {source}", .path.display())]
    Status { path: PathBuf, source: io::Error },

    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct Control {
    pid_file: PathBuf,
}

impl Control {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn status(&self) -> Result<Status, ControlError> {
        pidfile::check_status(&self.pid_file).map_err(|source| ControlError::Status {
            path: self.pid_file.clone(),
            source,
        })
    }

    /// Ask the running instance to shut down gracefully.
    pub fn stop(&self) -> Result<u32, ControlError> {
        self.send(Signal::Terminate)
    }

    /// Ask the running instance to hand off to a fresh copy of itself.
    pub fn reload(&self) -> Result<u32, ControlError> {
        self.send(Signal::Reload)
    }

    fn send(&self, signal: Signal) -> Result<u32, ControlError> {
        let status = self.status()?;
        if !status.running {
            return Err(ControlError::NotRunning(self.pid_file.clone()));
        }
        send_signal(status.pid, signal).map_err(|source| ControlError::Signal {
            pid: status.pid,
            source,
        })?;
        info!(pid = status.pid, ?signal, "Signal sent");
        Ok(status.pid)
    }
}
