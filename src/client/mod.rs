
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::pin;
use tokio::select;
use tokio_util::sync::CancellationToken;
use util::Conn;

use crate::error::*;
use crate::link::*;
use crate::proto::{self, Token, MAX_PACKET_SIZE, TOKEN_SIZE};
use crate::rendezvous::Rendezvous;

/// One reachable server address plus the local socket datagrams for it leave
/// through. Remotes of the same address family share one socket.
pub(crate) struct RemoteEndpoint {
    pub(crate) addr: SocketAddr,
    pub(crate) socket: Arc<dyn Conn + Send + Sync>,
}

/// Client side of a multi-path link: owns the per-family sockets, rotates
/// outbound datagrams across the configured remotes and funnels everything
/// received on any socket into one rendezvous for the engine to poll.
pub struct ClientLink {
    remotes: Vec<RemoteEndpoint>,
    sockets: Vec<Arc<dyn Conn + Send + Sync>>,
    token: Token,
    connection_id: AtomicU32,
    last_send: AtomicUsize,
    rendezvous: Rendezvous,
    receiver_count: AtomicUsize,
    close_notify: CancellationToken,
}

impl ClientLink {
    /// Builds a link towards `remotes`, binding one ephemeral UDP socket per
    /// allowed address family, and starts one receiver task per socket.
    ///
    /// Remotes of a disallowed family are skipped; a family whose bind fails
    /// is dropped for the rest of the call. Fails when no remote survives.
    pub async fn connect(remotes: &[SocketAddr], allow: AllowProtocol) -> Result<Arc<Self>> {
        let mut ipv4: Option<Option<Arc<dyn Conn + Send + Sync>>> = None;
        let mut ipv6: Option<Option<Arc<dyn Conn + Send + Sync>>> = None;
        let mut endpoints = Vec::new();

        for addr in remotes {
            if !allow.allows(&addr.ip()) {
                continue;
            }
            let (family, local) = if addr.is_ipv4() {
                (&mut ipv4, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            } else {
                (&mut ipv6, IpAddr::V6(Ipv6Addr::UNSPECIFIED))
            };
            if family.is_none() {
                *family = match bind_udp(SocketAddr::new(local, 0), false).await {
                    Ok(socket) => Some(Some(socket)),
                    Err(err) => {
                        log::warn!("can not bind an ephemeral socket for {}: {}", addr, err);
                        Some(None)
                    }
                };
            }
            if let Some(Some(socket)) = &*family {
                endpoints.push(RemoteEndpoint {
                    addr: *addr,
                    socket: Arc::clone(socket),
                });
            }
        }

        if endpoints.is_empty() {
            return Err(Error::ErrUnknownSocket);
        }
        let link = ClientLink::with_remotes(endpoints);
        link.spawn_receivers();
        Ok(link)
    }

    /// Resolves `host` and connects to every address it maps to on `port`.
    pub async fn connect_host(host: &str, port: u16, allow: AllowProtocol) -> Result<Arc<Self>> {
        let addrs: Vec<SocketAddr> = match lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                log::debug!("resolving {} failed: {}", host, err);
                return Err(Error::ErrHostNotFound);
            }
        };
        if addrs.is_empty() {
            return Err(Error::ErrHostNotFound);
        }
        ClientLink::connect(&addrs, allow).await
    }

    pub(crate) fn with_remotes(remotes: Vec<RemoteEndpoint>) -> Arc<Self> {
        let mut sockets: Vec<Arc<dyn Conn + Send + Sync>> = Vec::new();
        for remote in &remotes {
            if !sockets.iter().any(|s| Arc::ptr_eq(s, &remote.socket)) {
                sockets.push(Arc::clone(&remote.socket));
            }
        }
        Arc::new(ClientLink {
            remotes,
            sockets,
            token: Token::generate(),
            connection_id: AtomicU32::new(0),
            last_send: AtomicUsize::new(0),
            rendezvous: Rendezvous::new(),
            receiver_count: AtomicUsize::new(0),
            close_notify: CancellationToken::new(),
        })
    }

    pub(crate) fn spawn_receivers(self: &Arc<Self>) {
        for (index, socket) in self.sockets.iter().enumerate() {
            self.receiver_count.fetch_add(1, Ordering::SeqCst);
            let link = Arc::clone(self);
            let socket = Arc::clone(socket);
            tokio::spawn(async move { link.do_receive(index, socket).await });
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id.load(Ordering::SeqCst)
    }

    /// Called by the engine once the server has admitted this client;
    /// outbound datagrams stop carrying the token from here on.
    pub fn set_connection_id(&self, connection_id: u32) {
        self.connection_id.store(connection_id, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.close_notify.is_cancelled()
    }

    /// Engine out-callback: frames `data` for the wire and sends it down the
    /// next path. A short or failed send is fatal to the logical connection.
    pub async fn output(&self, data: &[u8]) -> Result<usize> {
        let connection_id = self.connection_id();
        let packet = if connection_id == 0 {
            if data.len() + TOKEN_SIZE > MAX_PACKET_SIZE {
                log::warn!("invalid engine payload of {} bytes", data.len());
                return Err(Error::ErrPacketTooLarge);
            }
            proto::make_token_packet(&self.token, &proto::make_data_packet(0, data))
        } else {
            if data.len() > MAX_PACKET_SIZE {
                log::warn!("invalid engine payload of {} bytes", data.len());
                return Err(Error::ErrPacketTooLarge);
            }
            proto::make_data_packet(connection_id, data)
        };

        let sent = match self.sendto(&packet, b"").await {
            Ok(sent) => sent,
            Err(err) => {
                log::debug!("can not send to connection {}: {}", connection_id, err);
                self.abort().await;
                return Err(Error::ErrSocketAccess);
            }
        };
        if sent != packet.len() {
            log::debug!("short send of {}/{} bytes", sent, packet.len());
            self.abort().await;
            return Err(Error::ErrSocketAccess);
        }
        Ok(sent)
    }

    /// Strict rotation over the remotes; the client has no way to observe
    /// per-path liveness, so every path gets an equal share.
    fn next_send(&self) -> usize {
        self.last_send.fetch_add(1, Ordering::SeqCst) % self.remotes.len()
    }

    async fn do_receive(self: Arc<Self>, index: usize, socket: Arc<dyn Conn + Send + Sync>) {
        log::trace!("do_receive_{} listening on {:?}", index, socket.local_addr().ok());
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let wait_cancel = self.close_notify.cancelled();
        pin!(wait_cancel);

        loop {
            let n = select! {
                biased;

                _ = &mut wait_cancel => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, _)) => n,
                    Err(err) => {
                        log::debug!("do_receive_{} exiting: {}", index, err);
                        break;
                    }
                }
            };
            // Return traffic never carries a token; hand it to the engine
            // as is, with an empty origin.
            if self.rendezvous.put(Vec::new(), buf[..n].to_vec()).await.is_err() {
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
        for socket in &self.sockets {
            let _ = socket.close().await;
        }
        self.rendezvous.close();
    }
}

#[async_trait]
impl Link for ClientLink {
    async fn sendto(&self, data: &[u8], _who: &[u8]) -> Result<usize> {
        if self.remotes.is_empty() {
            return Err(Error::ErrNoPathAvailable);
        }
        let remote = &self.remotes[self.next_send()];
        log::trace!("send {} bytes to {}", data.len(), remote.addr);
        Ok(remote.socket.send_to(data, remote.addr).await?)
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
}
