//! In-place reload with listener handoff.
//!
//! The old process spawns a successor of the same executable with its
//! registered files and listening sockets at descriptor 3 onwards:
//!
//! ```text
//! fd:  0 1 2 | 3 .. 3+F-1    | 3+F .. 3+F+L-1
//!      stdio | extra files   | listeners, in pool slot order
//! ```
//!
//! `MOLT_FD_<n>` names the files, `MOLT_LISTENERS` counts the sockets and
//! `MOLT_RELOAD` marks the successor. Once the successor has rebuilt its
//! pool it sends `SIGINT` to the old process, which then shuts down
//! gracefully while the successor is already accepting.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::PoisonError;

use thiserror::Error;
use tracing::{info, warn};

use crate::daemon::Daemon;
use crate::handoff::{
    fd_var, read_slots, FileDescriptorSlot, FIRST_EXTRA_FD, LISTENERS_VAR, RELOAD_SENTINEL,
    RELOAD_VAR,
};
use crate::listener::adopt_listener;
use crate::signals::Signal;
use crate::spawn::{ExtraFile, LaunchPlan, StdioPipes, StdioSource};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("cannot determine executable path: {0}")]
    Executable(#[source] io::Error),

    #[error("failed to duplicate descriptor for handoff: {0}")]
    Duplicate(#[source] io::Error),

    #[error("failed to spawn reload successor: {0}")]
    Launch(#[source] io::Error),

    #[error("failed to adopt inherited descriptor {fd}: {source}")]
    Adopt { fd: RawFd, source: io::Error },

    #[error("invalid listener count {0:?}")]
    ListenerCount(String),

    #[error("failed to enter working directory: {0}")]
    WorkDir(#[source] io::Error),

    #[error("failed to signal predecessor (pid {pid}): {source}")]
    SignalParent { pid: u32, source: io::Error },

    #[error("failed to reopen stdio: {0}")]
    Stdio(#[source] io::Error),
}

impl Daemon {
    /// Spawn a successor carrying every registered file and listener.
    ///
    /// The PID lock is released before the successor starts so it can take
    /// it over. If the launch fails the lock stays released.
    pub fn reload(&self) -> Result<u32, ReloadError> {
        let program = self.host.current_exe().map_err(ReloadError::Executable)?;

        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let listeners = self.pool.snapshot();

        let mut env = vec![
            (RELOAD_VAR.to_owned(), Some(RELOAD_SENTINEL.to_owned())),
            (LISTENERS_VAR.to_owned(), Some(listeners.len().to_string())),
        ];
        let mut extra_fds = Vec::with_capacity(files.len() + listeners.len());

        for (offset, file) in files.iter().enumerate() {
            let index = FIRST_EXTRA_FD + offset as RawFd;
            let key = fd_var(index);
            let slot = FileDescriptorSlot {
                index,
                name: file.name().to_path_buf(),
                previous: self.transport.get(&key),
            };
            env.push((key, Some(slot.encode())));
            extra_fds.push(file.try_clone_fd().map_err(ReloadError::Duplicate)?);
        }
        for listener in &listeners {
            extra_fds.push(listener.duplicate().map_err(ReloadError::Duplicate)?);
        }
        drop(files);

        if let Some(lock) = self
            .pid_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            lock.release();
        }

        let plan = LaunchPlan {
            program,
            args: self.host.args(),
            env,
            stdin: StdioSource::Inherit,
            stdout: StdioSource::Inherit,
            stderr: StdioSource::Inherit,
            extra_fds,
            new_session: false,
        };

        match self.host.launch(plan) {
            Ok(launched) => {
                info!(
                    pid = launched.pid,
                    listeners = listeners.len(),
                    "Spawned reload successor"
                );
                Ok(launched.pid)
            }
            Err(err) => {
                warn!(error = %err, "Reload launch failed, PID file is no longer locked");
                Err(ReloadError::Launch(err))
            }
        }
    }

    /// Successor side of a reload: rebuild files and the listener pool from
    /// inherited descriptors, then tell the predecessor to shut down.
    ///
    /// On failure the reload markers are left in place and nothing is
    /// registered; the predecessor keeps serving.
    pub(crate) fn reloaded(&self) -> Result<Option<StdioPipes>, ReloadError> {
        let count_raw = self.transport.get(LISTENERS_VAR);
        let count: usize = match count_raw.as_deref() {
            None => 0,
            Some(raw) => raw
                .parse()
                .map_err(|_| ReloadError::ListenerCount(raw.to_owned()))?,
        };

        let slots = read_slots(self.transport.as_ref());
        let mut files = Vec::with_capacity(slots.len());
        for slot in &slots {
            let fd = self.adopt(slot.index)?;
            files.push(ExtraFile::inherited(slot, fd));
        }

        let first_listener = FIRST_EXTRA_FD + slots.len() as RawFd;
        let mut listeners = Vec::with_capacity(count);
        for offset in 0..count {
            let fd = first_listener + offset as RawFd;
            let listener = adopt_listener(self.adopt(fd)?)
                .map_err(|source| ReloadError::Adopt { fd, source })?;
            listeners.push(listener);
        }

        self.host
            .enter_work_dir(&self.config.work_dir)
            .map_err(ReloadError::WorkDir)?;
        self.host.clear_umask();

        let reload_raw = self.transport.get(RELOAD_VAR);
        self.transport.remove(RELOAD_VAR);
        self.transport.remove(LISTENERS_VAR);

        let parent = self.host.parent_pid();
        if let Err(source) = self.host.signal(parent, Signal::Interrupt) {
            if let Some(raw) = &reload_raw {
                self.transport.set(RELOAD_VAR, raw);
            }
            if let Some(raw) = &count_raw {
                self.transport.set(LISTENERS_VAR, raw);
            }
            return Err(ReloadError::SignalParent { pid: parent, source });
        }
        info!(predecessor = parent, listeners = count, "Signalled predecessor to shut down");

        for slot in &slots {
            self.transport.restore(&fd_var(slot.index), slot.previous.as_deref());
        }
        for listener in listeners {
            self.pool.add(listener);
        }
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(files);

        if self.config.daemonize {
            self.host
                .stdio_handles()
                .map(Some)
                .map_err(ReloadError::Stdio)
        } else {
            Ok(None)
        }
    }

    fn adopt(&self, fd: RawFd) -> Result<std::os::unix::io::OwnedFd, ReloadError> {
        self.host
            .adopt_fd(fd)
            .map_err(|source| ReloadError::Adopt { fd, source })
    }
}
