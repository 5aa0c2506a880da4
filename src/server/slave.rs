
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::time::Instant;
use util::sync::Mutex as SyncMutex;
use util::Conn;

use crate::error::*;

use super::{BOOTSTRAP_WINDOW, PATH_FRESH_WINDOW};

/// One way of reaching a client: the remote address it sent from and the
/// local socket the datagram arrived on. Shared between the owning slave and
/// the local bind's token index.
pub(crate) struct PathBinding {
    pub(crate) remote: SocketAddr,
    pub(crate) socket: Arc<dyn Conn + Send + Sync>,
    last_active: SyncMutex<Instant>,
}

impl PathBinding {
    fn new(remote: SocketAddr, socket: Arc<dyn Conn + Send + Sync>) -> Self {
        PathBinding {
            remote,
            socket,
            last_active: SyncMutex::new(Instant::now()),
        }
    }

    /// Marks the path as fresh; called for every datagram matched to it.
    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub(crate) fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(*self.last_active.lock()) <= PATH_FRESH_WINDOW
    }
}

/// Per-client state on the server: the engine-assigned connection id and
/// every path the client has been observed on.
pub(crate) struct Slave {
    connection_id: AtomicU32,
    connected_at: Instant,
    paths: SyncMutex<Vec<Arc<PathBinding>>>,
    last_send: SyncMutex<isize>,
}

impl Slave {
    pub(crate) fn new(connection_id: u32) -> Self {
        Slave {
            connection_id: AtomicU32::new(connection_id),
            connected_at: Instant::now(),
            paths: SyncMutex::new(Vec::new()),
            last_send: SyncMutex::new(-1),
        }
    }

    pub(crate) fn connection_id(&self) -> u32 {
        self.connection_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connection_id(&self, connection_id: u32) {
        self.connection_id.store(connection_id, Ordering::SeqCst);
    }

    /// A slave that was never admitted must stop accepting token frames once
    /// the bootstrap window has passed; it is a stuck attempt.
    pub(crate) fn past_bootstrap(&self, now: Instant) -> bool {
        now.duration_since(self.connected_at) > BOOTSTRAP_WINDOW
    }

    /// Records a new path and returns it; the caller also indexes it in the
    /// local bind the datagram arrived on.
    pub(crate) fn append(
        &self,
        remote: SocketAddr,
        socket: Arc<dyn Conn + Send + Sync>,
    ) -> Arc<PathBinding> {
        let path = Arc::new(PathBinding::new(remote, socket));
        self.paths.lock().push(Arc::clone(&path));
        path
    }

    pub(crate) fn path_count(&self) -> usize {
        self.paths.lock().len()
    }

    pub(crate) fn has_path(&self, path: &Arc<PathBinding>) -> bool {
        self.paths.lock().iter().any(|p| Arc::ptr_eq(p, path))
    }

    /// Sends one datagram down the next live path.
    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize> {
        let (remote, socket) = {
            let paths = self.paths.lock();
            if paths.is_empty() {
                return Err(Error::ErrNoPathAvailable);
            }
            let path = &paths[self.next_send(&paths)];
            (path.remote, Arc::clone(&path.socket))
        };
        Ok(socket.send_to(data, remote).await?)
    }

    /// Rotation that skips paths with no inbound traffic for longer than the
    /// freshness window, wrapping once; falls back to the first path when
    /// every one of them is stale. The scan position persists so the next
    /// call continues from where this one ended.
    fn next_send(&self, paths: &[Arc<PathBinding>]) -> usize {
        let now = Instant::now();
        let mut last_send = self.last_send.lock();
        let last = *last_send;
        *last_send += 1;
        while (*last_send as usize) < paths.len() {
            if paths[*last_send as usize].is_fresh(now) {
                return *last_send as usize;
            }
            *last_send += 1;
        }
        *last_send = 0;
        while *last_send < last {
            if paths[*last_send as usize].is_fresh(now) {
                return *last_send as usize;
            }
            *last_send += 1;
        }
        0
    }
}
