use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("can not send udp packet")]
    ErrSocketAccess,
    #[error("host not found")]
    ErrHostNotFound,
    #[error("no usable remote address")]
    ErrUnknownSocket,
    #[error("can not bind any local address")]
    ErrBindFailed,
    #[error("use of closed link")]
    ErrClosed,
    #[error("too short buffer")]
    ErrShortBuffer,
    #[error("udp packet too large")]
    ErrPacketTooLarge,
    #[error("no such slave")]
    ErrSlaveNotFound,
    #[error("no path available")]
    ErrNoPathAvailable,
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
