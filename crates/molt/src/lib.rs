//! # molt
//!
//! Lifecycle management for long-running network servers: become a daemon,
//! hold a PID lock, and replace the running binary in place without
//! dropping listening sockets.
//!
//! ## Overview
//!
//! A process started through [`Daemon::make_daemon`] walks a short chain of
//! self re-execs. In foreground mode the chain is one hop; when daemonizing
//! the first hop also starts a new session and the second wires the final
//! process's output back into the host's [`Logger`]. The final process
//! takes the PID lock.
//!
//! A reload (`SIGHUP`) spawns a successor that inherits every pooled
//! listener and registered file at descriptor 3 onwards. The successor
//! starts accepting straight away and sends `SIGINT` to its predecessor,
//! which then drains in-flight connections and exits.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: reload
//! - `SIGINT` / `SIGTERM`: graceful shutdown
//!
//! Both arm a forced exit after the configured hammer timeout.
//!
//! ## Environment Variables
//!
//! Handoff state between stages travels in `MOLT_STAGE`, `MOLT_RELOAD`,
//! `MOLT_LISTENERS` and `MOLT_FD_<n>`. Configuration is read from
//! `MOLT_DAEMONIZE`, `MOLT_PID_FILE`, `MOLT_WORK_DIR` and
//! `MOLT_HAMMER_TIMEOUT_SECS` (see [`DaemonConfig`]).
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

pub mod config;
pub mod control;
pub mod daemon;
pub mod drain;
mod error;
pub mod handoff;
pub mod listener;
pub mod logger;
pub mod pidfile;
pub mod reload;
pub mod signals;
pub mod spawn;

pub use config::DaemonConfig;
pub use control::{Control, ControlError};
pub use daemon::Daemon;
pub use drain::{ConnectionGuard, DrainTracker};
pub use error::{Error, Result};
pub use handoff::{HandoffRecord, HandoffTransport, MemoryEnv, ProcessEnv, ProcessStage};
pub use listener::{ListenerError, ListenerPool, PooledListener, TrackedStream};
pub use logger::{FileLogger, Logger, TracingLogger};
pub use pidfile::{check_status, LockError, PidLock, Status};
pub use reload::ReloadError;
pub use signals::{
    CoordinatorHandle, HookPhase, LifecycleState, Signal, SignalCoordinator, SignalTarget,
};
pub use spawn::{ExtraFile, OsHost, ProcessHost, SpawnError, SpawnOutcome, StdioPipes, Terminal};
