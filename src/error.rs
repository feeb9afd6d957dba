use std::io;
use thiserror::Error;

/// RESP protocol violations detected by the request parser.
///
/// Each kind carries its exact wire rendering so the connection can
/// emit the error after earlier replies have drained.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid bulk length")]
    BadBulkLen,

    #[error("invalid multibulk length")]
    BadArrayLen,
}

impl ProtocolError {
    /// Wire form sent to the offending client.
    pub fn to_resp(self) -> Vec<u8> {
        format!("-ERR Protocol error: {}\r\n", self).into_bytes()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors produced by a peer closing its end mid-session.
    pub fn is_normal_close(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
