//! Explicit shutdown handle shared by the accept loop and every session

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown as SocketShutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

/// How long [`Shutdown::trigger`] waits when poking the accept loop awake
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable handle that stops a server and unwinds its sessions.
///
/// Sessions register their socket while they run. Triggering shuts every registered socket
/// down, which makes blocked reads return, and connects to the listener once so that a blocked
/// `accept` returns too.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    triggered: AtomicBool,
    listener_addr: Mutex<Option<SocketAddr>>,
    sessions: Mutex<HashMap<u64, TcpStream>>,
    next_session: AtomicU64,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Remember where the accept loop listens so that [`Self::trigger`] can wake it
    pub fn set_listener_addr(&self, addr: SocketAddr) {
        *lock(&self.inner.listener_addr) = Some(addr);
    }

    /// Stop accepting connections and abort every running session.
    ///
    /// Calling it more than once has no further effect.
    pub fn trigger(&self) {
        let sessions: Vec<TcpStream> = {
            // The flag flips under the sessions lock, so a concurrent register either lands
            // in the drained map or sees the flag.
            let mut registered = lock(&self.inner.sessions);
            if self.inner.triggered.swap(true, Ordering::SeqCst) {
                return;
            }
            registered.drain().map(|(_, stream)| stream).collect()
        };
        info!(sessions = sessions.len(), "shutting down");
        for stream in sessions {
            if let Err(e) = stream.shutdown(SocketShutdown::Both) {
                debug!(error = %e, "session socket already closed");
            }
        }

        if let Some(addr) = *lock(&self.inner.listener_addr) {
            let addr = connectable(addr);
            if let Err(e) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
                debug!(%addr, error = %e, "could not wake accept loop");
            }
        }
    }

    /// Register a session socket so that [`Self::trigger`] can interrupt it.
    ///
    /// The socket stays registered until the returned guard is dropped. Registering after
    /// shutdown has been triggered shuts the socket down straight away.
    pub fn register(&self, stream: &TcpStream) -> io::Result<Registration> {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let handle = stream.try_clone()?;

        let mut registered = lock(&self.inner.sessions);
        if self.is_triggered() {
            drop(registered);
            handle.shutdown(SocketShutdown::Both)?;
        } else {
            registered.insert(id, handle);
        }

        Ok(Registration {
            shutdown: self.clone(),
            id,
        })
    }

    /// Number of sessions currently registered
    pub fn active_sessions(&self) -> usize {
        lock(&self.inner.sessions).len()
    }
}

/// Keeps a session socket registered with a [`Shutdown`] handle
#[derive(Debug)]
pub struct Registration {
    shutdown: Shutdown,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.shutdown.inner.sessions).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A listener bound to the wildcard address is reached through loopback
fn connectable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
