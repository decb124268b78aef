//! Host-facing registration API of `Daemon`.
//!
//! Run with: `cargo test -p molt --test daemon_api`

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{config, daemon, init_tracing, FakeHost};
use molt::daemon::DEFAULT_SHUTDOWN_DELAY;
use molt::{
    Daemon, HookPhase, LifecycleState, ListenerError, MemoryEnv, PooledListener, Signal,
    SignalTarget,
};

fn fresh() -> Arc<Daemon> {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, _, _) = daemon(
        config(&dir.path().join("molt.pid"), false),
        FakeHost::new(1),
        MemoryEnv::new(),
    );
    Arc::new(daemon)
}

#[test]
fn test_listener_registration() {
    init_tracing();
    let daemon = fresh();
    let listener = daemon.add_listener(PooledListener::bind("127.0.0.1:0").unwrap());
    let address = listener.address().to_owned();

    let found = daemon.get_listener(&address).unwrap();
    assert!(Arc::ptr_eq(&found, &listener));
    assert!(matches!(
        daemon.get_listener("nonexistent:1"),
        Err(ListenerError::NotFound(_))
    ));

    daemon.close_listener(&address).unwrap();
    assert!(listener.is_closed());
    assert!(daemon.pool().is_empty());
    assert!(matches!(
        daemon.close_listener(&address),
        Err(ListenerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_token_and_runs_callback() {
    init_tracing();
    let daemon = fresh();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        daemon.register_shutdown(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let token = daemon.shutdown_token();
    assert!(!token.is_cancelled());

    SignalTarget::shutdown(daemon.as_ref()).await;
    assert!(token.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_default_shutdown_waits_one_second() {
    init_tracing();
    let daemon = fresh();
    let started = tokio::time::Instant::now();
    SignalTarget::shutdown(daemon.as_ref()).await;
    assert!(started.elapsed() >= DEFAULT_SHUTDOWN_DELAY);
    assert_eq!(DEFAULT_SHUTDOWN_DELAY, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_drives_daemon_state() {
    init_tracing();
    let daemon = fresh();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for phase in [HookPhase::Pre, HookPhase::Post] {
        let seen = Arc::clone(&seen);
        daemon.register_signal_hook(phase, Signal::Reload, move |signal| {
            seen.lock().unwrap().push((phase, signal));
        });
    }
    let mut state = daemon.subscribe_state();
    assert_eq!(daemon.state(), LifecycleState::Init);

    let handle = daemon.coordinator().start_detached();
    state.changed().await.unwrap();
    assert_eq!(*state.borrow(), LifecycleState::Running);
    assert_eq!(daemon.state(), LifecycleState::Running);

    // Reload through the fake host: nothing is registered, so the launch
    // carries no descriptors.
    assert!(handle.send(Signal::Reload));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(HookPhase::Pre, Signal::Reload), (HookPhase::Post, Signal::Reload)]
    );
    assert_eq!(daemon.state(), LifecycleState::Running);
    handle.abort();
}

#[test]
fn test_check_status_before_start() {
    init_tracing();
    let daemon = fresh();
    let status = daemon.check_status().unwrap();
    assert!(!status.running);
    assert_eq!(status.to_string(), "not running");
}
