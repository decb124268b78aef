//! Listening sockets that outlive a reload.
//!
//! The pool is the single owner of every listener the host serves on. Its
//! slot order is the order sockets are laid out in the successor's
//! descriptor table on reload, and the order they are re-registered in on
//! the other side.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::drain::{ConnectionGuard, DrainTracker};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("no listener bound to {0}")]
    NotFound(String),

    #[error("listener {0} is closed")]
    Closed(String),

    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A listening socket registered with a [`ListenerPool`].
#[derive(Debug)]
pub struct PooledListener {
    address: String,
    socket: StdTcpListener,
    tracker: DrainTracker,
    closed: AtomicBool,
    stop: CancellationToken,
    accept: OnceCell<TcpListener>,
}

impl PooledListener {
    /// Wrap an already bound socket.
    pub fn new(socket: StdTcpListener) -> io::Result<Self> {
        let address = socket.local_addr()?.to_string();
        Ok(Self {
            address,
            socket,
            tracker: DrainTracker::new(),
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            accept: OnceCell::new(),
        })
    }

    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Self::new(StdTcpListener::bind(addr)?)
    }

    /// Bound address in `SocketAddr` display form; the pool's lookup key.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Connections accepted here and not yet dropped.
    pub fn in_flight(&self) -> usize {
        self.tracker.active()
    }

    pub fn tracker(&self) -> &DrainTracker {
        &self.tracker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Accept one connection. The returned stream counts as in flight
    /// until it is dropped.
    ///
    /// Fails with [`ListenerError::Closed`] once [`close`](Self::close) has
    /// been called, including for an accept already waiting.
    pub async fn accept(&self) -> Result<(TrackedStream, SocketAddr), ListenerError> {
        if self.is_closed() {
            return Err(ListenerError::Closed(self.address.clone()));
        }

        let listener = self
            .accept
            .get_or_try_init(|| async {
                let socket = self.socket.try_clone()?;
                socket.set_nonblocking(true)?;
                TcpListener::from_std(socket)
            })
            .await?;

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(address = %self.address, peer = %peer, "Accepted connection");
                Ok((TrackedStream::new(stream, self.tracker.guard()), peer))
            }
            _ = self.stop.cancelled() => Err(ListenerError::Closed(self.address.clone())),
        }
    }

    /// Stop accepting. Returns `false` if the listener was already closed.
    ///
    /// Connections already accepted are not touched; use [`wait`](Self::wait)
    /// to find out when they are gone.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stop.cancel();
        info!(
            address = %self.address,
            in_flight = self.in_flight(),
            "Listener closed"
        );
        true
    }

    /// Wait until every accepted connection has been dropped.
    pub async fn wait(&self) {
        self.tracker.wait().await
    }

    /// New descriptor for the same socket, for handing to a successor.
    pub(crate) fn duplicate(&self) -> io::Result<OwnedFd> {
        Ok(self.socket.try_clone()?.into())
    }
}

/// An accepted connection that counts against its listener until dropped.
#[derive(Debug)]
pub struct TrackedStream {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

impl TrackedStream {
    fn new(stream: TcpStream, guard: ConnectionGuard) -> Self {
        Self {
            stream,
            _guard: guard,
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Ordered registry of live listeners.
///
/// Removal leaves an empty slot which the next [`add`](Self::add) reuses, so
/// existing listeners keep their positions.
#[derive(Debug, Default)]
pub struct ListenerPool {
    slots: RwLock<Vec<Option<Arc<PooledListener>>>>,
}

impl ListenerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` in the first free slot.
    pub fn add(&self, listener: PooledListener) -> Arc<PooledListener> {
        let listener = Arc::new(listener);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = Some(Arc::clone(&listener));
                free
            }
            None => {
                slots.push(Some(Arc::clone(&listener)));
                slots.len() - 1
            }
        };
        info!(address = %listener.address(), slot, "Registered listener");
        listener
    }

    /// Look a listener up by its bound address.
    pub fn get(&self, address: &str) -> Result<Arc<PooledListener>, ListenerError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .find(|l| l.address() == address)
            .cloned()
            .ok_or_else(|| ListenerError::NotFound(address.to_owned()))
    }

    /// Close the listener bound to `address` and free its slot.
    pub fn close(&self, address: &str) -> Result<(), ListenerError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|l| l.address() == address))
            .ok_or_else(|| ListenerError::NotFound(address.to_owned()))?;
        if let Some(listener) = slot.take() {
            listener.close();
        }
        Ok(())
    }

    /// Close every listener. Slots are kept so reload order is unaffected.
    pub fn close_all(&self) {
        for listener in self.snapshot() {
            listener.close();
        }
    }

    /// Live listeners in slot order.
    pub fn snapshot(&self) -> Vec<Arc<PooledListener>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no listener has a connection in flight.
    pub async fn wait_idle(&self) {
        let listeners = self.snapshot();
        futures::future::join_all(listeners.iter().map(|l| l.wait())).await;
    }

    /// Wait up to `timeout` for every listener to go idle. Returns `false`
    /// if any still had connections when time ran out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let listeners = self.snapshot();
        futures::future::join_all(listeners.iter().map(|l| l.tracker().drain(timeout)))
            .await
            .into_iter()
            .all(|drained| drained)
    }
}

/// Whether `fd` refers to a socket.
pub(crate) fn is_socket(fd: BorrowedFd<'_>) -> bool {
    // SAFETY: fstat only writes into the zeroed buffer we hand it.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Turn an inherited descriptor back into a pooled listener.
pub(crate) fn adopt_listener(fd: OwnedFd) -> io::Result<PooledListener> {
    if !is_socket(fd.as_fd()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor {} is not a socket", fd.as_raw_fd()),
        ));
    }
    PooledListener::new(StdTcpListener::from(fd))
}
