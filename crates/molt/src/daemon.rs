//! The host-facing lifecycle handle.
//!
//! One [`Daemon`] per lifecycle, passed around explicitly. Typical use:
//!
//! ```ignore
//! let daemon = Arc::new(Daemon::new(DaemonConfig::from_env()));
//! daemon.make_daemon()?;               // before starting any runtime
//! runtime.block_on(async {
//!     let listener = match daemon.get_listener("127.0.0.1:8080") {
//!         Ok(inherited) => inherited,
//!         Err(_) => daemon.add_listener(PooledListener::bind("127.0.0.1:8080")?),
//!     };
//!     daemon.run_signals()?;
//!     // serve on `listener` until `daemon.shutdown_token()` fires
//! });
//! ```

use std::fs::File;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::handoff::{
    HandoffRecord, HandoffTransport, ProcessEnv, ProcessStage, RELOAD_VAR, STAGE_VAR,
};
use crate::listener::{ListenerError, ListenerPool, PooledListener};
use crate::logger::Logger;
use crate::pidfile::{self, LockError, PidLock, Status};
use crate::signals::{
    CoordinatorHandle, HookPhase, LifecycleState, Signal, SignalCoordinator, SignalHooks,
    SignalTarget,
};
use crate::spawn::{ExtraFile, OsHost, ProcessHost, SpawnError, SpawnOutcome, Spawner, StdioPipes};
use crate::Error;

/// Delay used by the default shutdown callback before the process exits.
pub const DEFAULT_SHUTDOWN_DELAY: Duration = Duration::from_secs(1);

type ShutdownCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Daemon {
    pub(crate) config: DaemonConfig,
    pub(crate) host: Arc<dyn ProcessHost>,
    pub(crate) transport: Arc<dyn HandoffTransport>,
    logger: Option<Arc<dyn Logger>>,
    pub(crate) pool: ListenerPool,
    pub(crate) files: Mutex<Vec<ExtraFile>>,
    pub(crate) pid_lock: Mutex<Option<PidLock>>,
    hooks: Arc<RwLock<SignalHooks>>,
    shutdown: RwLock<ShutdownCallback>,
    state: Arc<watch::Sender<LifecycleState>>,
    stop: CancellationToken,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Init);
        Self {
            config,
            host: Arc::new(OsHost),
            transport: Arc::new(ProcessEnv),
            logger: None,
            pool: ListenerPool::new(),
            files: Mutex::new(Vec::new()),
            pid_lock: Mutex::new(None),
            hooks: Arc::new(RwLock::new(SignalHooks::new())),
            shutdown: RwLock::new(Arc::new(default_shutdown)),
            state: Arc::new(state),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = host;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HandoffTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Bring the process into its final form.
    ///
    /// In a fresh start this runs the spawn sequence: intermediate stages
    /// exit here and never return. In a reload successor it rebuilds the
    /// inherited listeners and signals the predecessor. Either way the
    /// returning process holds the PID lock.
    ///
    /// Returns the daemon's stdout/stderr when daemonized.
    pub fn make_daemon(&self) -> crate::Result<Option<StdioPipes>> {
        // Both paths below change directory before the lock is taken.
        let pid_file = self.pid_file()?;

        if self.is_reload() {
            info!("Starting as reload successor");
            let stdio = self.reloaded()?;
            self.lock_pid_file(pid_file)?;
            return Ok(stdio);
        }

        if self.stage() == ProcessStage::Parent {
            let status = pidfile::check_status(&pid_file)?;
            if status.running {
                return Err(LockError::AlreadyLocked { pid: status.pid }.into());
            }
        }

        match self.spawn() {
            Ok(SpawnOutcome::Handoff { pid }) => {
                info!(successor = pid, "Handed off to successor, exiting");
                std::process::exit(0);
            }
            Ok(SpawnOutcome::Ready(terminal)) => {
                self.lock_pid_file(pid_file)?;
                Ok(terminal.stdio)
            }
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Spawn failed after stdio redirect");
                std::process::exit(1);
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run one stage of the spawn sequence without exiting.
    ///
    /// On reaching the terminal stage the inherited files are kept for
    /// future reloads.
    pub fn spawn(&self) -> Result<SpawnOutcome, SpawnError> {
        let spawner = self.spawner();
        let files = std::mem::take(&mut *self.files.lock().unwrap_or_else(PoisonError::into_inner));
        let outcome = spawner.spawn(files)?;

        if let SpawnOutcome::Ready(terminal) = &outcome {
            let kept = terminal
                .files
                .iter()
                .map(ExtraFile::try_clone)
                .collect::<io::Result<Vec<_>>>()
                .map_err(|source| SpawnError::Terminal {
                    stage: spawner.terminal_stage(),
                    source,
                })?;
            self.files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(kept);
        }
        Ok(outcome)
    }

    fn spawner(&self) -> Spawner {
        Spawner::new(
            Arc::clone(&self.host),
            Arc::clone(&self.transport),
            self.config.daemonize,
            self.config.work_dir.clone(),
        )
        .with_logger(self.logger.clone())
    }

    /// Stage of the spawn sequence this process is in.
    pub fn stage(&self) -> ProcessStage {
        HandoffRecord::decode(self.transport.get(STAGE_VAR).as_deref()).stage
    }

    /// Whether this process was started by a reload.
    pub fn is_reload(&self) -> bool {
        self.transport.get(RELOAD_VAR).is_some()
    }

    fn pid_file(&self) -> io::Result<PathBuf> {
        absolute(&self.config.pid_file)
    }

    fn lock_pid_file(&self, path: PathBuf) -> crate::Result<()> {
        let lock = PidLock::acquire(path)?;
        *self.pid_lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(lock);
        Ok(())
    }

    /// Whether another instance holds the configured PID file.
    pub fn check_status(&self) -> io::Result<Status> {
        pidfile::check_status(self.pid_file()?)
    }

    /// Keep `file` open across the spawn sequence and reloads.
    pub fn add_file(&self, file: ExtraFile) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file);
    }

    /// A fresh handle on the kept file registered as `name`.
    pub fn clone_file(&self, name: &Path) -> io::Result<Option<File>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.name() == name)
            .map(|f| f.try_clone_fd().map(File::from))
            .transpose()
    }

    /// Names of the files kept across re-execs, in descriptor order.
    pub fn file_names(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|f| f.name().to_path_buf())
            .collect()
    }

    pub fn pool(&self) -> &ListenerPool {
        &self.pool
    }

    pub fn add_listener(&self, listener: PooledListener) -> Arc<PooledListener> {
        self.pool.add(listener)
    }

    pub fn get_listener(&self, address: &str) -> Result<Arc<PooledListener>, ListenerError> {
        self.pool.get(address)
    }

    pub fn close_listener(&self, address: &str) -> Result<(), ListenerError> {
        self.pool.close(address)
    }

    /// Replace the shutdown callback. It runs once, on the first
    /// `SIGINT`/`SIGTERM`; the process exits 0 when it returns.
    pub fn register_shutdown<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.shutdown.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(move || callback().boxed());
    }

    pub fn register_signal_hook<F>(&self, phase: HookPhase, signal: Signal, callback: F)
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(phase, signal, Box::new(callback));
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Cancelled when graceful shutdown begins; accept loops watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Start handling `SIGHUP`, `SIGINT` and `SIGTERM`. Must be called from
    /// inside a tokio runtime, after [`make_daemon`](Self::make_daemon).
    pub fn run_signals(self: &Arc<Self>) -> io::Result<CoordinatorHandle> {
        self.coordinator().start()
    }

    /// A coordinator bound to this daemon, not yet started.
    pub fn coordinator(self: &Arc<Self>) -> SignalCoordinator {
        SignalCoordinator::new(
            Arc::clone(self) as Arc<dyn SignalTarget>,
            Arc::clone(&self.hooks),
            Arc::clone(&self.state),
            self.config.hammer_timeout(),
        )
    }
}

impl SignalTarget for Daemon {
    fn reload(&self) -> crate::Result<()> {
        Daemon::reload(self).map(|_| ()).map_err(Error::from)
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        self.stop.cancel();
        let callback = Arc::clone(&self.shutdown.read().unwrap_or_else(PoisonError::into_inner));
        callback()
    }

    fn exit(&self, code: i32) {
        info!(code, "Exiting");
        std::process::exit(code);
    }

    fn logger(&self) -> Option<Arc<dyn Logger>> {
        self.logger.clone()
    }
}

fn default_shutdown() -> BoxFuture<'static, ()> {
    tokio::time::sleep(DEFAULT_SHUTDOWN_DELAY).boxed()
}

/// Relative paths resolve against the current directory. A reload successor
/// starts in the work dir, so relative PID files only make sense when they
/// are relative to it.
fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
