
use std::fmt;

use rand::RngCore;

/// Plain data frame: `[type | connection_id(4, big-endian) | payload]`.
pub const PACKET_TYPE_UNCOMPRESSED_DATA: u8 = 0x01;
/// Bootstrap frame: `[type | token(256) | data frame]`.
pub const PACKET_TYPE_UNCOMPRESSED_DATA_WITH_TOKEN: u8 = 0x05;

pub const TOKEN_SIZE: usize = 256;

/// Smallest frame the demultiplexer accepts: type byte plus connection id.
pub const MIN_PACKET_SIZE: usize = 5;
/// Largest datagram accepted at the engine callback boundary.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Bytes a token frame adds in front of the inner data frame.
pub const TOKEN_FRAME_OVERHEAD: usize = 1 + TOKEN_SIZE;

/// Random client identifier used while the server has not yet assigned a
/// connection id. Uniqueness is probabilistic; the server treats two equal
/// tokens as the same client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Token(bytes)
    }

    /// `None` unless `data` is exactly `TOKEN_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; TOKEN_SIZE] = data.try_into().ok()?;
        Some(Token(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

/// Where an inbound datagram should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demux {
    /// A token frame; the inner data frame starts at `TOKEN_FRAME_OVERHEAD`.
    Token(Token),
    /// Every other frame type carries the connection id at bytes 1..5 and is
    /// passed through to the engine unchanged.
    ConnectionId(u32),
}

/// Builds `[PACKET_TYPE_UNCOMPRESSED_DATA | connection_id | payload]`.
pub fn make_data_packet(connection_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MIN_PACKET_SIZE + payload.len());
    packet.push(PACKET_TYPE_UNCOMPRESSED_DATA);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Wraps a complete data frame in a token frame.
pub fn make_token_packet(token: &Token, frame: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(TOKEN_FRAME_OVERHEAD + frame.len());
    packet.push(PACKET_TYPE_UNCOMPRESSED_DATA_WITH_TOKEN);
    packet.extend_from_slice(token.as_bytes());
    packet.extend_from_slice(frame);
    packet
}

/// Classifies one inbound datagram, or `None` when it is malformed and must
/// be dropped. Token frames must carry a full inner data frame; the inner
/// connection id field is the authoritative one after unwrapping.
pub fn classify(datagram: &[u8]) -> Option<Demux> {
    if datagram.len() < MIN_PACKET_SIZE {
        return None;
    }
    if datagram[0] == PACKET_TYPE_UNCOMPRESSED_DATA_WITH_TOKEN {
        if datagram.len() < TOKEN_FRAME_OVERHEAD + MIN_PACKET_SIZE {
            return None;
        }
        let token = Token::from_slice(&datagram[1..TOKEN_FRAME_OVERHEAD])?;
        Some(Demux::Token(token))
    } else {
        let connection_id = u32::from_be_bytes([
            datagram[1],
            datagram[2],
            datagram[3],
            datagram[4],
        ]);
        Some(Demux::ConnectionId(connection_id))
    }
}

/// The inner data frame of a token frame classified by [`classify`].
pub fn token_frame_inner(datagram: &[u8]) -> &[u8] {
    &datagram[TOKEN_FRAME_OVERHEAD..]
}
