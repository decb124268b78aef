//! Test doubles for driving the lifecycle without spawning processes.
//!
//! A [`FakeHost`] records every launch instead of executing it. The next
//! "process" in a chain is built from the recorded plan with
//! [`FakeHost::successor`]: its descriptor table holds the plan's extra
//! descriptors at 3 onwards and its environment is the parent's with the
//! plan's overrides applied.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::io::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use molt::spawn::{LaunchPlan, Launched, StdioSource};
use molt::{
    Daemon, DaemonConfig, HandoffTransport, Logger, MemoryEnv, ProcessHost, Signal, SignalTarget,
    StdioPipes,
};

pub const FAKE_EXE: &str = "/usr/local/bin/fake-molt";

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// What a launch looked like, minus the descriptors.
#[derive(Debug, Clone)]
pub struct RecordedLaunch {
    pub pid: u32,
    pub program: PathBuf,
    pub env: Vec<(String, Option<String>)>,
    pub stdin: StdioSource,
    pub stdout: StdioSource,
    pub stderr: StdioSource,
    pub new_session: bool,
    pub fd_count: usize,
}

impl RecordedLaunch {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

pub struct FakeHost {
    pub pid: u32,
    pub parent: u32,
    pub next_pid: Arc<AtomicU32>,
    pub inherited: Mutex<HashMap<RawFd, OwnedFd>>,
    pub launches: Mutex<Vec<(RecordedLaunch, Vec<OwnedFd>)>>,
    pub work_dirs: Mutex<Vec<PathBuf>>,
    pub umask_cleared: AtomicUsize,
    pub signals: Mutex<Vec<(u32, Signal)>>,
    pub fail_signal: bool,
    pub fail_launch: bool,
}

impl FakeHost {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            parent: 1,
            next_pid: Arc::new(AtomicU32::new(pid + 1)),
            inherited: Mutex::new(HashMap::new()),
            launches: Mutex::new(Vec::new()),
            work_dirs: Mutex::new(Vec::new()),
            umask_cleared: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            fail_signal: false,
            fail_launch: false,
        }
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(launch, _)| launch.clone())
            .collect()
    }

    pub fn last_launch(&self) -> RecordedLaunch {
        self.launches().pop().expect("nothing was launched")
    }

    /// The process started by the most recent launch, with `env` as the
    /// environment this process had at the time.
    pub fn successor(&self, env: &MemoryEnv) -> (FakeHost, MemoryEnv) {
        let (launch, fds) = self
            .launches
            .lock()
            .unwrap()
            .pop()
            .expect("nothing was launched");

        let child = FakeHost {
            pid: launch.pid,
            parent: self.pid,
            next_pid: Arc::clone(&self.next_pid),
            ..FakeHost::new(launch.pid)
        };
        {
            let mut table = child.inherited.lock().unwrap();
            for (offset, fd) in fds.into_iter().enumerate() {
                table.insert(3 + offset as RawFd, fd);
            }
        }
        (child, env.derive(&launch.env))
    }

    pub fn inherited_count(&self) -> usize {
        self.inherited.lock().unwrap().len()
    }
}

impl ProcessHost for FakeHost {
    fn current_exe(&self) -> io::Result<PathBuf> {
        Ok(PathBuf::from(FAKE_EXE))
    }

    fn args(&self) -> Vec<OsString> {
        vec![OsString::from("start")]
    }

    fn launch(&self, plan: LaunchPlan) -> io::Result<Launched> {
        if self.fail_launch {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let record = RecordedLaunch {
            pid,
            program: plan.program,
            env: plan.env,
            stdin: plan.stdin,
            stdout: plan.stdout,
            stderr: plan.stderr,
            new_session: plan.new_session,
            fd_count: plan.extra_fds.len(),
        };
        self.launches.lock().unwrap().push((record, plan.extra_fds));
        Ok(Launched {
            pid,
            stdout: None,
            stderr: None,
        })
    }

    fn adopt_fd(&self, fd: RawFd) -> io::Result<OwnedFd> {
        self.inherited
            .lock()
            .unwrap()
            .remove(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn enter_work_dir(&self, dir: &Path) -> io::Result<()> {
        self.work_dirs.lock().unwrap().push(dir.to_path_buf());
        Ok(())
    }

    fn clear_umask(&self) {
        self.umask_cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn stdio_handles(&self) -> io::Result<StdioPipes> {
        Ok(StdioPipes {
            stdout: tempfile::tempfile()?,
            stderr: tempfile::tempfile()?,
        })
    }

    fn parent_pid(&self) -> u32 {
        self.parent
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        if self.fail_signal {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        self.signals.lock().unwrap().push((pid, signal));
        Ok(())
    }
}

/// A daemon wired to `host` and `env`.
pub fn daemon(config: DaemonConfig, host: FakeHost, env: MemoryEnv) -> (Daemon, Arc<FakeHost>, Arc<MemoryEnv>) {
    let host = Arc::new(host);
    let env = Arc::new(env);
    let daemon = Daemon::new(config)
        .with_host(Arc::clone(&host) as Arc<dyn ProcessHost>)
        .with_transport(Arc::clone(&env) as Arc<dyn HandoffTransport>);
    (daemon, host, env)
}

pub fn config(pid_file: &Path, daemonize: bool) -> DaemonConfig {
    DaemonConfig {
        daemonize,
        pid_file: pid_file.to_path_buf(),
        work_dir: PathBuf::from("/srv/molt"),
        ..DaemonConfig::default()
    }
}

/// How [`FakeTarget::shutdown`] behaves.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownBehavior {
    Immediate,
    Never,
    Panic,
}

/// Records what the coordinator asks of it instead of acting.
pub struct FakeTarget {
    pub reloads: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub exits: Mutex<Vec<i32>>,
    pub behavior: ShutdownBehavior,
    pub log: Arc<Mutex<Vec<String>>>,
    pub fail_reload: bool,
}

impl FakeTarget {
    pub fn new(behavior: ShutdownBehavior) -> Self {
        Self {
            reloads: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            exits: Mutex::new(Vec::new()),
            behavior,
            log: Arc::new(Mutex::new(Vec::new())),
            fail_reload: false,
        }
    }

    pub fn exits(&self) -> Vec<i32> {
        self.exits.lock().unwrap().clone()
    }
}

impl SignalTarget for FakeTarget {
    fn reload(&self) -> molt::Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("reload".to_owned());
        if self.fail_reload {
            return Err(io::Error::from(io::ErrorKind::NotFound).into());
        }
        Ok(())
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("shutdown".to_owned());
        match self.behavior {
            ShutdownBehavior::Immediate => futures::future::ready(()).boxed(),
            ShutdownBehavior::Never => futures::future::pending().boxed(),
            ShutdownBehavior::Panic => async { panic!("shutdown callback failed") }.boxed(),
        }
    }

    fn exit(&self, code: i32) {
        self.exits.lock().unwrap().push(code);
    }

    fn logger(&self) -> Option<Arc<dyn Logger>> {
        let log = Arc::clone(&self.log);
        Some(Arc::new(move |args: std::fmt::Arguments<'_>| {
            log.lock().unwrap().push(args.to_string())
        }))
    }
}
