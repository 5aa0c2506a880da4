#[cfg(test)]
mod server_test;

pub(crate) mod slave;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::pin;
use tokio::select;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use util::sync::Mutex as SyncMutex;
use util::Conn;

use crate::error::*;
use crate::link::*;
use crate::proto::{self, Demux, Token, MIN_PACKET_SIZE};
use crate::rendezvous::Rendezvous;
use slave::{PathBinding, Slave};

/// How long after creation a slave keeps accepting token frames. Past this
/// the engine must have admitted it, or the attempt is considered stuck.
pub(crate) const BOOTSTRAP_WINDOW: Duration = Duration::from_secs(15);
/// How recently a path must have carried inbound traffic to be preferred
/// for outbound datagrams.
pub(crate) const PATH_FRESH_WINDOW: Duration = Duration::from_secs(30);

/// One bound local socket plus the paths already observed through it,
/// indexed by client token.
pub(crate) struct LocalBind {
    pub(crate) socket: Arc<dyn Conn + Send + Sync>,
    pub(crate) token_to_path: SyncMutex<HashMap<Token, Arc<PathBinding>>>,
}

impl LocalBind {
    pub(crate) fn new(socket: Arc<dyn Conn + Send + Sync>) -> Arc<Self> {
        Arc::new(LocalBind {
            socket,
            token_to_path: SyncMutex::new(HashMap::new()),
        })
    }
}

#[derive(Default)]
struct ServerState {
    token_to_slave: HashMap<Token, Arc<Slave>>,
    connection_id_to_token: HashMap<u32, Token>,
}

/// Server side of a multi-path link: owns the local binds, identifies the
/// client behind every inbound datagram and hands the engine one datagram at
/// a time together with the origin token.
pub struct ServerLink {
    binds: Vec<Arc<LocalBind>>,
    state: SyncMutex<ServerState>,
    rendezvous: Rendezvous,
    receiver_count: AtomicUsize,
    close_notify: CancellationToken,
}

impl ServerLink {
    /// Binds every local address that can be bound and starts one receiver
    /// task per bind. Fails when no address could be bound at all.
    pub async fn bind(locals: &[SocketAddr], mode: BindMode) -> Result<Arc<Self>> {
        let mut binds = Vec::new();
        for addr in locals {
            match bind_udp(*addr, mode.reuse_address()).await {
                Ok(socket) => binds.push(LocalBind::new(socket)),
                Err(err) => {
                    log::warn!("can not bind {}: {}", addr, err);
                }
            }
        }
        if binds.is_empty() {
            return Err(Error::ErrBindFailed);
        }
        let link = ServerLink::with_binds(binds);
        link.spawn_receivers();
        Ok(link)
    }

    pub(crate) fn with_binds(binds: Vec<Arc<LocalBind>>) -> Arc<Self> {
        Arc::new(ServerLink {
            binds,
            state: SyncMutex::new(ServerState::default()),
            rendezvous: Rendezvous::new(),
            receiver_count: AtomicUsize::new(0),
            close_notify: CancellationToken::new(),
        })
    }

    pub(crate) fn spawn_receivers(self: &Arc<Self>) {
        for index in 0..self.binds.len() {
            self.receiver_count.fetch_add(1, Ordering::SeqCst);
            let link = Arc::clone(self);
            tokio::spawn(async move { link.do_receive(index).await });
        }
    }

    /// The addresses actually bound, in bind order.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.binds
            .iter()
            .map(|bind| Ok(bind.socket.local_addr()?))
            .collect()
    }

    /// Draws an unused, non-zero connection id for the engine to assign.
    pub fn next_connection_id(&self) -> u32 {
        let state = self.state.lock();
        loop {
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            let id = u32::from_be_bytes(bytes);
            // 0 is the wire's "not yet assigned" marker.
            if id != 0 && !state.connection_id_to_token.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_notify.is_cancelled()
    }

    /// Classifies one datagram and updates the path bookkeeping. Returns the
    /// origin token and the frame to forward to the engine, or `None` when
    /// the datagram must be dropped.
    pub(crate) fn handle_datagram(
        &self,
        bind: &LocalBind,
        from: SocketAddr,
        datagram: &[u8],
    ) -> Option<(Token, Vec<u8>)> {
        let now = Instant::now();
        match proto::classify(datagram) {
            None => {
                log::trace!("got an invalid packet of {} bytes from {}", datagram.len(), from);
                None
            }
            Some(Demux::Token(token)) => {
                let mut state = self.state.lock();
                let known_path = bind.token_to_path.lock().get(&token).cloned();
                if let Some(path) = known_path {
                    // A bound path without a slave means teardown raced this
                    // datagram; drop it.
                    let slave = state.token_to_slave.get(&token)?;
                    if slave.past_bootstrap(now) {
                        log::trace!("reject stale bootstrap data for {}", token);
                        return None;
                    }
                    path.touch();
                } else if let Some(slave) = state.token_to_slave.get(&token).cloned() {
                    if slave.past_bootstrap(now) {
                        log::trace!("reject stale bootstrap data for {}", token);
                        return None;
                    }
                    let path = slave.append(from, Arc::clone(&bind.socket));
                    bind.token_to_path.lock().insert(token, path);
                } else {
                    let new_slave = Arc::new(Slave::new(0));
                    let path = new_slave.append(from, Arc::clone(&bind.socket));
                    bind.token_to_path.lock().insert(token, path);
                    state.token_to_slave.insert(token, new_slave);
                    log::debug!("new slave {} from {}", token, from);
                }
                Some((token, proto::token_frame_inner(datagram).to_vec()))
            }
            Some(Demux::ConnectionId(connection_id)) => {
                let state = self.state.lock();
                let token = match state.connection_id_to_token.get(&connection_id) {
                    Some(token) => *token,
                    None => {
                        log::trace!("reject data for unknown connection {}", connection_id);
                        return None;
                    }
                };
                let known_path = bind.token_to_path.lock().get(&token).cloned();
                if let Some(path) = known_path {
                    path.touch();
                } else {
                    // A new path past bootstrap; the connection id alone
                    // vouches for it, so an observer of the id could inject
                    // one here.
                    let slave = state.token_to_slave.get(&token)?;
                    let path = slave.append(from, Arc::clone(&bind.socket));
                    bind.token_to_path.lock().insert(token, path);
                    log::debug!("new path from {} for connection {}", from, connection_id);
                }
                Some((token, datagram.to_vec()))
            }
        }
    }

    async fn do_receive(self: Arc<Self>, index: usize) {
        let bind = Arc::clone(&self.binds[index]);
        log::trace!("do_accept_{} listening on {:?}", index, bind.socket.local_addr().ok());
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let wait_cancel = self.close_notify.cancelled();
        pin!(wait_cancel);

        loop {
            let (n, from) = select! {
                biased;

                _ = &mut wait_cancel => break,
                result = bind.socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => (n, from),
                    Err(err) => {
                        log::debug!("do_accept_{} exiting: {}", index, err);
                        break;
                    }
                }
            };
            if n < MIN_PACKET_SIZE {
                log::trace!("got an invalid packet of {} bytes from {}", n, from);
                continue;
            }
            let Some((token, frame)) = self.handle_datagram(&bind, from, &buf[..n]) else {
                continue;
            };
            if self
                .rendezvous
                .put(token.as_bytes().to_vec(), frame)
                .await
                .is_err()
            {
                break;
            }
        }

        // The last receiver out wakes the engine with end of stream.
        if self.receiver_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.rendezvous.close();
        }
    }

    async fn shutdown(&self) {
        self.close_notify.cancel();
        for bind in &self.binds {
            let _ = bind.socket.close().await;
        }
        self.rendezvous.close();
    }

    fn remove_slave(&self, who: &[u8]) {
        let Some(token) = Token::from_slice(who) else {
            return;
        };
        let mut state = self.state.lock();
        let Some(removed) = state.token_to_slave.remove(&token) else {
            return;
        };
        state.connection_id_to_token.remove(&removed.connection_id());
        for bind in &self.binds {
            bind.token_to_path.lock().remove(&token);
        }
        log::debug!("removed slave {}", token);
    }
}

#[async_trait]
impl Link for ServerLink {
    async fn sendto(&self, data: &[u8], who: &[u8]) -> Result<usize> {
        let token = Token::from_slice(who).ok_or(Error::ErrSlaveNotFound)?;
        let slave = {
            let state = self.state.lock();
            state
                .token_to_slave
                .get(&token)
                .cloned()
                .ok_or(Error::ErrSlaveNotFound)?
        };
        slave.send(data).await
    }

    async fn recvfrom(&self, buf: &mut [u8], who: &mut Vec<u8>) -> Result<usize> {
        self.rendezvous.take(buf, who).await
    }

    async fn close(&self) {
        self.shutdown().await;
    }

    async fn abort(&self) {
        self.shutdown().await;
    }

    async fn close_slave(&self, who: &[u8]) {
        self.remove_slave(who);
    }

    async fn abort_slave(&self, who: &[u8]) {
        self.remove_slave(who);
    }

    async fn add_slave(&self, who: &[u8], connection_id: u32) -> bool {
        let Some(token) = Token::from_slice(who) else {
            return false;
        };
        let mut state = self.state.lock();
        let Some(slave) = state.token_to_slave.get(&token) else {
            return false;
        };
        slave.set_connection_id(connection_id);
        state.connection_id_to_token.insert(connection_id, token);
        true
    }
}
