use std::net::{IpAddr, SocketAddr};
use std::ops::BitOr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use util::Conn;

use crate::error::*;

/// Receive buffer handed to every receiver task.
pub(crate) const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Address families a client link is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowProtocol(u8);

pub const ALLOW_IPV4: AllowProtocol = AllowProtocol(0b01);
pub const ALLOW_IPV6: AllowProtocol = AllowProtocol(0b10);
pub const ALLOW_ANY: AllowProtocol = AllowProtocol(0b11);

impl BitOr for AllowProtocol {
    type Output = AllowProtocol;

    fn bitor(self, rhs: AllowProtocol) -> AllowProtocol {
        AllowProtocol(self.0 | rhs.0)
    }
}

impl AllowProtocol {
    pub fn allows(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => self.0 & ALLOW_IPV4.0 != 0,
            IpAddr::V6(_) => self.0 & ALLOW_IPV6.0 != 0,
        }
    }
}

/// Socket options applied when a server link binds its local addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindMode(u8);

pub const BIND_DEFAULT: BindMode = BindMode(0);
pub const BIND_REUSE_ADDRESS: BindMode = BindMode(0b01);

impl BitOr for BindMode {
    type Output = BindMode;

    fn bitor(self, rhs: BindMode) -> BindMode {
        BindMode(self.0 | rhs.0)
    }
}

impl BindMode {
    pub fn reuse_address(&self) -> bool {
        self.0 & BIND_REUSE_ADDRESS.0 != 0
    }
}

/// The contract a link presents to the reliability engine.
///
/// `who` identifies the peer the datagram belongs to: always empty on the
/// client, the 256-byte token on the server. The slave operations are no-ops
/// on the client, mirroring the one-connection-per-link shape there.
#[async_trait]
pub trait Link {
    /// Sends one datagram towards the peer identified by `who`.
    async fn sendto(&self, data: &[u8], who: &[u8]) -> Result<usize>;

    /// Receives the next datagram. `Ok(0)` means the link is finished and no
    /// more data will arrive.
    async fn recvfrom(&self, buf: &mut [u8], who: &mut Vec<u8>) -> Result<usize>;

    /// Hook for adapters sitting between the link and the engine; the core
    /// never claims a datagram here.
    fn filter(&self, _data: &mut [u8], _len: &mut usize, _who: &mut Vec<u8>) -> bool {
        false
    }

    async fn close(&self);

    async fn abort(&self);

    async fn close_slave(&self, _who: &[u8]) {}

    async fn abort_slave(&self, _who: &[u8]) {}

    /// Registers the engine-assigned connection id for `who`. Returns
    /// `false` when there is no such peer.
    async fn add_slave(&self, _who: &[u8], _connection_id: u32) -> bool {
        false
    }
}

/// Binds a UDP socket, going through socket2 when options must be set before
/// the bind happens.
pub(crate) async fn bind_udp(
    addr: SocketAddr,
    reuse_address: bool,
) -> Result<Arc<dyn Conn + Send + Sync>> {
    let socket = if reuse_address {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())?
    } else {
        UdpSocket::bind(addr).await?
    };
    Ok(Arc::new(socket))
}
