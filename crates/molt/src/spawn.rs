//! Multi-stage self re-exec.
//!
//! There is no `fork` here: each stage builds an explicit descriptor table,
//! spawns a fresh copy of the current executable with it, and hands control
//! over by exiting. The stage travels in the handoff record.
//!
//! ```text
//! foreground:  Parent ──spawn──▶ FirstChild (terminal)
//! daemonize:   Parent ──spawn+setsid──▶ FirstChild ──spawn──▶ Daemon (terminal)
//!                stdio → /dev/null          stdout/stderr → pipes relayed
//!                                           into the host's logger
//! ```
//!
//! Failures in the `Parent` stage come back as ordinary errors. Once a
//! stage is running with redirected stdio there is nobody left to report
//! to, so [`SpawnError::is_fatal`] tells the caller to exit non-zero.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::handoff::{
    fd_var, read_slots, FileDescriptorSlot, HandoffRecord, HandoffTransport, ProcessStage,
    FIRST_EXTRA_FD, STAGE_VAR,
};
use crate::logger::Logger;
use crate::signals::{send_signal, Signal};

/// Temporary descriptors are parked at or above this index while the child
/// is set up, so they cannot collide with the `3..N` target range.
const STAGING_FD_BASE: RawFd = 100;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("cannot determine executable path, daemonization is not supported: {source}")]
    Executable {
        stage: ProcessStage,
        source: io::Error,
    },

    #[error("failed to spawn successor from {stage:?} stage: {source}")]
    Launch {
        stage: ProcessStage,
        source: io::Error,
    },

    #[error("failed to adopt inherited descriptor {fd} in {stage:?} stage: {source}")]
    Adopt {
        stage: ProcessStage,
        fd: RawFd,
        source: io::Error,
    },

    #[error("failed to enter terminal stage: {source}")]
    Terminal {
        stage: ProcessStage,
        source: io::Error,
    },
}

impl SpawnError {
    pub fn stage(&self) -> ProcessStage {
        match self {
            SpawnError::Executable { stage, .. }
            | SpawnError::Launch { stage, .. }
            | SpawnError::Adopt { stage, .. }
            | SpawnError::Terminal { stage, .. } => *stage,
        }
    }

    /// Whether stdio had already been redirected when this happened.
    pub fn is_fatal(&self) -> bool {
        self.stage() != ProcessStage::Parent
    }
}

/// A file the host wants to keep open across re-execs.
#[derive(Debug)]
pub struct ExtraFile {
    name: PathBuf,
    fd: OwnedFd,
    index: Option<RawFd>,
}

impl ExtraFile {
    pub fn new(name: impl Into<PathBuf>, fd: impl Into<OwnedFd>) -> Self {
        Self {
            name: name.into(),
            fd: fd.into(),
            index: None,
        }
    }

    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::new(path, file))
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Descriptor index this file was inherited at, if it was inherited.
    pub fn index(&self) -> Option<RawFd> {
        self.index
    }

    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            fd: self.fd.try_clone()?,
            index: self.index,
        })
    }

    pub fn into_file(self) -> File {
        File::from(self.fd)
    }

    pub(crate) fn inherited(slot: &FileDescriptorSlot, fd: OwnedFd) -> Self {
        Self {
            name: slot.name.clone(),
            fd,
            index: Some(slot.index),
        }
    }
}

impl AsFd for ExtraFile {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Where a successor's standard stream comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioSource {
    Inherit,
    Null,
    Piped,
}

impl StdioSource {
    fn into_stdio(self) -> Stdio {
        match self {
            StdioSource::Inherit => Stdio::inherit(),
            StdioSource::Null => Stdio::null(),
            StdioSource::Piped => Stdio::piped(),
        }
    }
}

/// Everything needed to start a successor.
#[derive(Debug)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Changes on top of the current environment; `None` removes the key.
    pub env: Vec<(String, Option<String>)>,
    pub stdin: StdioSource,
    pub stdout: StdioSource,
    pub stderr: StdioSource,
    /// Placed at descriptor 3, 4, ... in order.
    pub extra_fds: Vec<OwnedFd>,
    /// Start the successor in a new session.
    pub new_session: bool,
}

/// A started successor. Nothing waits on it.
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Standard output and error of the final daemon process.
#[derive(Debug)]
pub struct StdioPipes {
    pub stdout: File,
    pub stderr: File,
}

/// Operating-system effects used by the spawner and reload path.
pub trait ProcessHost: Send + Sync {
    fn current_exe(&self) -> io::Result<PathBuf>;

    /// Arguments to pass on, without `argv[0]`.
    fn args(&self) -> Vec<OsString>;

    fn launch(&self, plan: LaunchPlan) -> io::Result<Launched>;

    /// Take ownership of a descriptor inherited at `fd`.
    fn adopt_fd(&self, fd: RawFd) -> io::Result<OwnedFd>;

    fn enter_work_dir(&self, dir: &Path) -> io::Result<()>;

    fn clear_umask(&self);

    /// Fresh handles on this process's stdout and stderr.
    fn stdio_handles(&self) -> io::Result<StdioPipes>;

    fn parent_pid(&self) -> u32;

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// The real process.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsHost;

impl ProcessHost for OsHost {
    fn current_exe(&self) -> io::Result<PathBuf> {
        std::env::current_exe()?.canonicalize()
    }

    fn args(&self) -> Vec<OsString> {
        std::env::args_os().skip(1).collect()
    }

    fn launch(&self, plan: LaunchPlan) -> io::Result<Launched> {
        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .stdin(plan.stdin.into_stdio())
            .stdout(plan.stdout.into_stdio())
            .stderr(plan.stderr.into_stdio());
        for (key, value) in &plan.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }

        // Park every source above the target range first. Dup'ing straight
        // to 3..N could overwrite a source that happens to live there.
        let staged = plan
            .extra_fds
            .iter()
            .map(|fd| fd.as_fd().try_clone_to_owned_at_least(STAGING_FD_BASE))
            .collect::<io::Result<Vec<_>>>()?;
        let sources: Vec<RawFd> = staged.iter().map(AsRawFd::as_raw_fd).collect();
        let new_session = plan.new_session;

        // SAFETY: the closure runs between fork and exec and only calls
        // async-signal-safe functions (setsid, dup2) on pre-built data.
        unsafe {
            command.pre_exec(move || {
                if new_session && libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                for (offset, source) in sources.iter().enumerate() {
                    // dup2 clears FD_CLOEXEC on the target.
                    if libc::dup2(*source, FIRST_EXTRA_FD + offset as RawFd) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        drop(staged);

        Ok(Launched {
            pid: child.id(),
            stdout: child.stdout.take().map(OwnedFd::from),
            stderr: child.stderr.take().map(OwnedFd::from),
        })
    }

    fn adopt_fd(&self, fd: RawFd) -> io::Result<OwnedFd> {
        // SAFETY: fcntl only inspects the descriptor table.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // Keep it from leaking into unrelated children; successors get
        // explicit copies.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the descriptor is open and nothing else in this process
        // claims it; inherited descriptors are handed out exactly once.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn enter_work_dir(&self, dir: &Path) -> io::Result<()> {
        std::env::set_current_dir(dir)
    }

    fn clear_umask(&self) {
        // SAFETY: umask cannot fail.
        unsafe {
            libc::umask(0);
        }
    }

    fn stdio_handles(&self) -> io::Result<StdioPipes> {
        Ok(StdioPipes {
            stdout: File::from(io::stdout().as_fd().try_clone_to_owned()?),
            stderr: File::from(io::stderr().as_fd().try_clone_to_owned()?),
        })
    }

    fn parent_pid(&self) -> u32 {
        std::os::unix::process::parent_id()
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        send_signal(pid, signal)
    }
}

trait TryCloneAtLeast {
    fn try_clone_to_owned_at_least(&self, min: RawFd) -> io::Result<OwnedFd>;
}

impl TryCloneAtLeast for std::os::unix::io::BorrowedFd<'_> {
    fn try_clone_to_owned_at_least(&self, min: RawFd) -> io::Result<OwnedFd> {
        // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor we then own.
        let fd = unsafe { libc::fcntl(self.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

/// Result of running one stage.
#[derive(Debug)]
pub enum SpawnOutcome {
    /// A successor owns the sequence now; this process should exit 0.
    Handoff { pid: u32 },
    /// This is the final process.
    Ready(Terminal),
}

/// What the final stage hands back to the host.
#[derive(Debug)]
pub struct Terminal {
    /// Set only when daemonizing.
    pub stdio: Option<StdioPipes>,
    pub files: Vec<ExtraFile>,
}

/// Runs one step of the re-exec sequence.
pub struct Spawner {
    host: Arc<dyn ProcessHost>,
    transport: Arc<dyn HandoffTransport>,
    logger: Option<Arc<dyn Logger>>,
    daemonize: bool,
    work_dir: PathBuf,
}

impl Spawner {
    pub fn new(
        host: Arc<dyn ProcessHost>,
        transport: Arc<dyn HandoffTransport>,
        daemonize: bool,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            transport,
            logger: None,
            daemonize,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_logger(mut self, logger: Option<Arc<dyn Logger>>) -> Self {
        self.logger = logger;
        self
    }

    /// Stage the sequence ends in for the configured mode.
    pub fn terminal_stage(&self) -> ProcessStage {
        if self.daemonize {
            ProcessStage::Daemon
        } else {
            ProcessStage::FirstChild
        }
    }

    /// Stage the current process is in.
    pub fn current_stage(&self) -> ProcessStage {
        HandoffRecord::decode(self.transport.get(STAGE_VAR).as_deref()).stage
    }

    /// Run the current stage.
    ///
    /// `files` are only consulted in the `Parent` stage; later stages
    /// rebuild them from the inherited descriptors.
    pub fn spawn(&self, files: Vec<ExtraFile>) -> Result<SpawnOutcome, SpawnError> {
        let record = HandoffRecord::decode(self.transport.get(STAGE_VAR).as_deref());
        let stage = record.stage;
        debug!(?stage, trusted = record.trusted, daemonize = self.daemonize, "Running spawn stage");

        let files = if stage == ProcessStage::Parent {
            files
        } else {
            if !files.is_empty() {
                debug!(count = files.len(), "Ignoring files registered after the first stage");
            }
            self.adopt_files(stage)?
        };

        let program = self
            .host
            .current_exe()
            .map_err(|source| SpawnError::Executable { stage, source })?;

        let next = match stage.next() {
            Some(next) if stage < self.terminal_stage() => next,
            _ => return self.finish(stage, record, files).map(SpawnOutcome::Ready),
        };

        let mut env = vec![(
            STAGE_VAR.to_owned(),
            Some(HandoffRecord::encode(next, record.carried.as_deref())),
        )];
        if stage == ProcessStage::Parent {
            for (offset, file) in files.iter().enumerate() {
                let index = FIRST_EXTRA_FD + offset as RawFd;
                let key = fd_var(index);
                let slot = FileDescriptorSlot {
                    index,
                    name: file.name().to_path_buf(),
                    previous: self.transport.get(&key),
                };
                env.push((key, Some(slot.encode())));
            }
        }

        let (stdin, stdout, stderr) = match (self.daemonize, stage) {
            (true, ProcessStage::Parent) => (StdioSource::Null, StdioSource::Null, StdioSource::Null),
            (true, _) => (StdioSource::Inherit, StdioSource::Piped, StdioSource::Piped),
            (false, _) => (StdioSource::Inherit, StdioSource::Inherit, StdioSource::Inherit),
        };

        let extra_fds = files
            .iter()
            .map(ExtraFile::try_clone_fd)
            .collect::<io::Result<Vec<_>>>()
            .map_err(|source| SpawnError::Launch { stage, source })?;

        let plan = LaunchPlan {
            program,
            args: self.host.args(),
            env,
            stdin,
            stdout,
            stderr,
            extra_fds,
            new_session: self.daemonize && stage == ProcessStage::Parent,
        };

        let launched = self
            .host
            .launch(plan)
            .map_err(|source| SpawnError::Launch { stage, source })?;
        info!(pid = launched.pid, from = ?stage, to = ?next, "Spawned successor");

        if let (Some(stdout), Some(stderr)) = (launched.stdout, launched.stderr) {
            match &self.logger {
                Some(logger) => relay(logger, stdout, stderr),
                None => debug!("No logger registered, daemon output is discarded"),
            }
        }

        Ok(SpawnOutcome::Handoff { pid: launched.pid })
    }

    fn adopt_files(&self, stage: ProcessStage) -> Result<Vec<ExtraFile>, SpawnError> {
        read_slots(self.transport.as_ref())
            .iter()
            .map(|slot| {
                let fd = self.host.adopt_fd(slot.index).map_err(|source| SpawnError::Adopt {
                    stage,
                    fd: slot.index,
                    source,
                })?;
                Ok(ExtraFile::inherited(slot, fd))
            })
            .collect()
    }

    fn finish(
        &self,
        stage: ProcessStage,
        record: HandoffRecord,
        files: Vec<ExtraFile>,
    ) -> Result<Terminal, SpawnError> {
        let terminal = |source| SpawnError::Terminal { stage, source };

        self.host.enter_work_dir(&self.work_dir).map_err(terminal)?;
        self.host.clear_umask();

        // Put back whatever the variables held before we started.
        for slot in read_slots(self.transport.as_ref()) {
            self.transport.restore(&fd_var(slot.index), slot.previous.as_deref());
        }
        self.transport.restore(STAGE_VAR, record.carried.as_deref());

        let stdio = if self.daemonize {
            Some(self.host.stdio_handles().map_err(terminal)?)
        } else {
            None
        };

        info!(
            ?stage,
            work_dir = %self.work_dir.display(),
            files = files.len(),
            "Reached terminal stage"
        );
        Ok(Terminal { stdio, files })
    }
}

/// Copy a successor's output into `logger` line by line until both
/// streams close.
fn relay(logger: &Arc<dyn Logger>, stdout: OwnedFd, stderr: OwnedFd) {
    let pump = |fd: OwnedFd, stream: &'static str| {
        let logger = Arc::clone(logger);
        std::thread::spawn(move || {
            for line in BufReader::new(File::from(fd)).lines() {
                match line {
                    Ok(line) => logger.log(format_args!("{line}")),
                    Err(err) => {
                        warn!(stream, error = %err, "Relay read failed");
                        break;
                    }
                }
            }
        })
    };

    let handles = [pump(stdout, "stdout"), pump(stderr, "stderr")];
    for handle in handles {
        if handle.join().is_err() {
            error!("Relay thread panicked");
        }
    }
}
