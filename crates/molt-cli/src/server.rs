//! TCP echo service on top of the listener pool.

use std::fs::File;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::{Context, Result};
use molt::{Daemon, ListenerError, PooledListener, TrackedStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

type AccessLog = Arc<Mutex<File>>;

/// Take over inherited listeners or bind new ones, then serve until the
/// process is told to stop.
pub async fn run(daemon: Arc<Daemon>, config: ServerConfig) -> Result<()> {
    let access_log: Option<AccessLog> = match &config.access_log {
        Some(path) => daemon
            .clone_file(path)
            .with_context(|| format!("Failed to reopen access log {}", path.display()))?
            .map(|file| Arc::new(Mutex::new(file))),
        None => None,
    };

    for address in &config.listen {
        let listener = take_or_bind(&daemon, address)?;
        tokio::spawn(accept_loop(listener, access_log.clone()));
    }

    register_drain(&daemon, &config);
    let _signals = daemon
        .run_signals()
        .context("Failed to install signal handlers")?;

    info!(
        pid = std::process::id(),
        listeners = daemon.pool().len(),
        "moltd ready"
    );

    daemon.shutdown_token().cancelled().await;
    info!("Shutdown started, draining connections");

    // The signal coordinator ends the process from here.
    std::future::pending::<()>().await;
    Ok(())
}

/// The pool keys listeners by their bound `ip:port`, so `address` is
/// resolved before looking for an inherited socket.
fn take_or_bind(daemon: &Daemon, address: &str) -> Result<Arc<PooledListener>> {
    let resolved: Vec<SocketAddr> = address
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {address}"))?
        .collect();

    for addr in &resolved {
        match daemon.get_listener(&addr.to_string()) {
            Ok(inherited) => {
                info!(address = %address, bound = %addr, "Serving on inherited listener");
                return Ok(inherited);
            }
            Err(ListenerError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let bound = PooledListener::bind(resolved.as_slice())
        .with_context(|| format!("Failed to bind {address}"))?;
    Ok(daemon.add_listener(bound))
}

fn register_drain(daemon: &Arc<Daemon>, config: &ServerConfig) {
    let weak: Weak<Daemon> = Arc::downgrade(daemon);
    let timeout = config.drain_timeout();
    daemon.register_shutdown(move || {
        let weak = weak.clone();
        async move {
            let Some(daemon) = weak.upgrade() else {
                return;
            };
            let pool = daemon.pool();
            pool.close_all();
            if !pool.drain(timeout).await {
                warn!(timeout_secs = timeout.as_secs(), "Exiting with connections still open");
            }
        }
    });
}

async fn accept_loop(listener: Arc<PooledListener>, access_log: Option<AccessLog>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(echo(stream, peer, access_log.clone()));
            }
            Err(ListenerError::Closed(address)) => {
                debug!(address = %address, "Accept loop finished");
                break;
            }
            Err(err) => warn!(address = %listener.address(), error = %err, "Accept failed"),
        }
    }
}

async fn echo(stream: TrackedStream, peer: SocketAddr, access_log: Option<AccessLog>) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let copied = tokio::io::copy(&mut reader, &mut writer).await;

    match &copied {
        Ok(bytes) => debug!(peer = %peer, bytes, "Connection closed"),
        Err(err) => debug!(peer = %peer, error = %err, "Connection failed"),
    }

    if let Some(log) = access_log {
        let bytes = copied.unwrap_or(0);
        let mut file = log.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(file, "{peer} {bytes}") {
            warn!(error = %err, "Failed to write access log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt::DaemonConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_inherited_listener_found_by_hostname() {
        let daemon = Daemon::new(DaemonConfig::default());
        let inherited = daemon.add_listener(PooledListener::bind("127.0.0.1:0").unwrap());
        let port = inherited.local_addr().unwrap().port();

        let found = take_or_bind(&daemon, &format!("localhost:{port}")).unwrap();
        assert!(Arc::ptr_eq(&found, &inherited));
        assert_eq!(daemon.pool().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_address_is_bound_once() {
        let daemon = Daemon::new(DaemonConfig::default());
        let bound = take_or_bind(&daemon, "127.0.0.1:0").unwrap();
        assert_eq!(daemon.pool().len(), 1);

        let again = take_or_bind(&daemon, bound.address()).unwrap();
        assert!(Arc::ptr_eq(&again, &bound));
    }

    #[test]
    fn test_unresolvable_address_is_an_error() {
        let daemon = Daemon::new(DaemonConfig::default());
        let err = take_or_bind(&daemon, "not an address").unwrap_err();
        assert!(err.to_string().contains("Failed to resolve"));
        assert!(daemon.pool().is_empty());
    }

    #[tokio::test]
    async fn test_echo_and_access_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.log");
        let log = Arc::new(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .unwrap(),
        ));

        let listener = Arc::new(PooledListener::bind("127.0.0.1:0").unwrap());
        let addr = listener.local_addr().unwrap();
        let accepting = tokio::spawn(accept_loop(Arc::clone(&listener), Some(log)));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"molt").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"molt");
        let local = client.local_addr().unwrap();
        drop(client);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while listener.in_flight() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should finish");

        assert!(listener.close());
        accepting.await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            format!("{local} 4\n")
        );
    }
}
