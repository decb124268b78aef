//! PID file guarded by an advisory exclusive lock.
//!
//! The lock, not the file content, decides whether an instance is running:
//! a PID file left behind by a crashed process is unlocked and therefore
//! stale. The content is only used to find out *which* process to signal.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// Errors from taking the PID lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process holds the lock. `pid` is 0 when the file content
    /// could not be parsed.
    #[error("already running (pid {pid})")]
    AlreadyLocked { pid: u32 },

    #[error("failed to open PID file {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to lock PID file {}: {source}", .path.display())]
    Lock { path: PathBuf, source: io::Error },

    #[error("failed to write PID file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Exclusive hold on a PID file. Released on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    /// Open (creating if absent) and lock `path`, then record our PID in it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        if let Err(err) = try_lock(&file) {
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(LockError::AlreadyLocked {
                    pid: read_pid(&mut file),
                });
            }
            return Err(LockError::Lock { path, source: err });
        }

        let pid = std::process::id();
        write_pid(&mut file, pid).map_err(|source| LockError::Write {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), pid, "Acquired PID lock");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop the lock ahead of process exit.
    pub fn release(self) {
        debug!(path = %self.path.display(), "Releasing PID lock");
        drop(self);
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by `self.file` and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Result of probing a PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub running: bool,
    pub pid: u32,
}

impl Status {
    pub const STOPPED: Status = Status {
        running: false,
        pid: 0,
    };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.running, self.pid) {
            (false, _) => write!(f, "not running"),
            (true, 0) => write!(f, "running (pid unknown)"),
            (true, pid) => write!(f, "running (pid {pid})"),
        }
    }
}

/// Probe `path` without disturbing a running instance.
///
/// If the lock can be taken nobody is running; it is released again as soon
/// as the probe returns. A missing file means not running.
pub fn check_status(path: impl AsRef<Path>) -> io::Result<Status> {
    let mut file = match OpenOptions::new().read(true).open(path.as_ref()) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Status::STOPPED),
        Err(err) => return Err(err),
    };

    match try_lock(&file) {
        Ok(()) => Ok(Status::STOPPED),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Status {
            running: true,
            pid: read_pid(&mut file),
        }),
        Err(err) => Err(err),
    }
}

fn try_lock(file: &File) -> io::Result<()> {
    // SAFETY: flock on a descriptor we own.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_pid(file: &mut File) -> u32 {
    let mut content = String::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut content).is_err() {
        return 0;
    }
    content.trim().parse().unwrap_or(0)
}

fn write_pid(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}
