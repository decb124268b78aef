//! Host-supplied log sink.
//!
//! The core reports its own progress through `tracing`. The [`Logger`] is
//! the channel for things that belong to the host's log: output relayed
//! from a detached daemon's stdout/stderr and the forced-exit diagnostic.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub trait Logger: Send + Sync {
    fn log(&self, args: fmt::Arguments<'_>);
}

impl<F> Logger for F
where
    F: Fn(fmt::Arguments<'_>) + Send + Sync,
{
    fn log(&self, args: fmt::Arguments<'_>) {
        self(args)
    }
}

/// Forwards every line to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "molt::relay", "{}", args);
    }
}

/// Appends every line to a file.
///
/// A detached daemon's relay process has `/dev/null` for its own output,
/// so this is the sink that keeps relayed lines.
#[derive(Debug)]
pub struct FileLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLogger {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Logger for FileLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(file, "{args}") {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to write log line");
        }
    }
}
