//! Signal-driven lifecycle coordinator.
//!
//! - `SIGHUP` → reload: spawn a successor carrying the listener pool
//! - `SIGINT` / `SIGTERM` → graceful shutdown through the host's callback
//!
//! Signals are forwarded into one queue and handled strictly one at a time.
//! Every reload or shutdown also arms a forced-exit timer ("hammer time"):
//! if the process is still alive when it fires, it exits regardless of what
//! the graceful path is doing.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::logger::Logger;

/// Exit status used when the hammer timer ends the process.
pub const HAMMER_EXIT_CODE: i32 = 1;

/// Signals the coordinator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// `SIGHUP`
    Reload,
    /// `SIGINT`
    Interrupt,
    /// `SIGTERM`
    Terminate,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Reload, Signal::Interrupt, Signal::Terminate];

    pub fn raw(self) -> libc::c_int {
        match self {
            Signal::Reload => libc::SIGHUP,
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
        }
    }

    fn kind(self) -> SignalKind {
        match self {
            Signal::Reload => SignalKind::hangup(),
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
        }
    }
}

/// Deliver `sig` to `pid`.
pub fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, sig.raw()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Pre,
    Post,
}

pub type HookCallback = Box<dyn Fn(Signal) + Send + Sync>;

/// Extra callbacks run around the built-in handling of a signal.
#[derive(Default)]
pub struct SignalHooks {
    hooks: HashMap<(HookPhase, Signal), Vec<HookCallback>>,
}

impl SignalHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, phase: HookPhase, signal: Signal, callback: HookCallback) {
        self.hooks.entry((phase, signal)).or_default().push(callback);
    }

    /// Run the callbacks for `phase`/`signal` in registration order.
    pub fn fire(&self, phase: HookPhase, signal: Signal) {
        if let Some(callbacks) = self.hooks.get(&(phase, signal)) {
            debug!(?phase, ?signal, count = callbacks.len(), "Running signal hooks");
            for callback in callbacks {
                callback(signal);
            }
        }
    }
}

impl std::fmt::Debug for SignalHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self.hooks.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("SignalHooks").field("hooks", &counts).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Running,
    ShuttingDown,
    Terminate,
}

/// What the coordinator drives.
pub trait SignalTarget: Send + Sync + 'static {
    /// Spawn a successor carrying the current listeners.
    fn reload(&self) -> crate::Result<()>;

    /// The host's graceful shutdown.
    fn shutdown(&self) -> BoxFuture<'static, ()>;

    /// End the process.
    fn exit(&self, code: i32);

    fn logger(&self) -> Option<Arc<dyn Logger>> {
        None
    }
}

/// Serialized consumer of lifecycle signals.
pub struct SignalCoordinator {
    target: Arc<dyn SignalTarget>,
    hooks: Arc<RwLock<SignalHooks>>,
    state: Arc<watch::Sender<LifecycleState>>,
    hammer_timeout: Duration,
    armed: Arc<AtomicUsize>,
}

/// Handle to a running coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
    queue: mpsc::UnboundedSender<Signal>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Queue `signal` as if the OS had delivered it.
    pub fn send(&self, signal: Signal) -> bool {
        self.queue.send(signal).is_ok()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl SignalCoordinator {
    pub fn new(
        target: Arc<dyn SignalTarget>,
        hooks: Arc<RwLock<SignalHooks>>,
        state: Arc<watch::Sender<LifecycleState>>,
        hammer_timeout: Duration,
    ) -> Self {
        Self {
            target,
            hooks,
            state,
            hammer_timeout,
            armed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of forced-exit timers armed so far.
    pub fn armed_timers(&self) -> usize {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribe to OS signals and start consuming them. Moves the
    /// lifecycle to `Running`.
    pub fn start(self) -> io::Result<CoordinatorHandle> {
        let (queue, rx) = mpsc::unbounded_channel();

        for sig in Signal::ALL {
            let mut stream = signal(sig.kind())?;
            let queue = queue.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if queue.send(sig).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(self.spawn_queue(queue, rx))
    }

    /// Start consuming without subscribing to OS signals; events arrive only
    /// through [`CoordinatorHandle::send`].
    pub fn start_detached(self) -> CoordinatorHandle {
        let (queue, rx) = mpsc::unbounded_channel();
        self.spawn_queue(queue, rx)
    }

    fn spawn_queue(
        self,
        queue: mpsc::UnboundedSender<Signal>,
        mut rx: mpsc::UnboundedReceiver<Signal>,
    ) -> CoordinatorHandle {
        self.state.send_replace(LifecycleState::Running);
        info!("Signal coordinator running");

        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                self.dispatch(signal);
            }
        });

        CoordinatorHandle { queue, task }
    }

    /// Handle one signal: pre hooks, built-in action, post hooks.
    pub fn dispatch(&self, signal: Signal) {
        info!(?signal, state = ?self.state(), "Received signal");

        self.fire(HookPhase::Pre, signal);
        match signal {
            Signal::Reload => self.on_reload(),
            Signal::Interrupt | Signal::Terminate => self.on_shutdown(signal),
        }
        self.fire(HookPhase::Post, signal);
    }

    fn fire(&self, phase: HookPhase, signal: Signal) {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .fire(phase, signal);
    }

    fn on_reload(&self) {
        match self.target.reload() {
            Ok(()) => info!("Reload successor spawned, waiting for it to take over"),
            Err(err) => error!(error = %err, "Reload failed, continuing with current process"),
        }
        self.arm_hammer(Signal::Reload);
    }

    fn on_shutdown(&self, signal: Signal) {
        if self.state() != LifecycleState::Running {
            debug!(?signal, state = ?self.state(), "Shutdown already in progress");
            return;
        }

        self.state.send_replace(LifecycleState::ShuttingDown);
        self.arm_hammer(signal);

        let target = Arc::clone(&self.target);
        let state = Arc::clone(&self.state);
        let graceful = tokio::spawn(target.shutdown());
        tokio::spawn(async move {
            match graceful.await {
                Ok(()) => {
                    state.send_replace(LifecycleState::Terminate);
                    info!("Graceful shutdown complete");
                    target.exit(0);
                }
                Err(err) if err.is_panic() => {
                    error!(
                        panic = %panic_message(err.into_panic().as_ref()),
                        "Shutdown callback panicked, waiting for hammer time"
                    );
                }
                Err(err) => warn!(error = %err, "Shutdown callback cancelled"),
            }
        });
    }

    fn arm_hammer(&self, reason: Signal) {
        let armed = self.armed.fetch_add(1, Ordering::SeqCst) + 1;
        let target = Arc::clone(&self.target);
        let delay = self.hammer_timeout;
        debug!(?reason, delay_ms = delay.as_millis() as u64, armed, "Hammer timer armed");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let logged = panic::catch_unwind(AssertUnwindSafe(|| {
                warn!(?reason, delay_secs = delay.as_secs(), "Hammer time: forcing exit");
                if let Some(logger) = target.logger() {
                    logger.log(format_args!(
                        "{reason:?} did not finish within {delay:?}, forcing exit"
                    ));
                }
            }));
            if let Err(payload) = logged {
                error!(panic = %panic_message(payload.as_ref()), "Panic during hammer time");
            }
            target.exit(HAMMER_EXIT_CODE);
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_signal_numbers() {
        assert_eq!(Signal::Reload.raw(), libc::SIGHUP);
        assert_eq!(Signal::Interrupt.raw(), libc::SIGINT);
        assert_eq!(Signal::Terminate.raw(), libc::SIGTERM);
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = SignalHooks::new();
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            hooks.register(
                HookPhase::Pre,
                Signal::Reload,
                Box::new(move |_: Signal| seen.lock().unwrap().push(n)),
            );
        }

        hooks.fire(HookPhase::Pre, Signal::Reload);
        hooks.fire(HookPhase::Post, Signal::Reload);
        hooks.fire(HookPhase::Pre, Signal::Terminate);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_send_signal_to_missing_process() {
        // pid_t::MAX is never a live pid.
        let err = send_signal(libc::pid_t::MAX as u32, Signal::Terminate).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }
}
