use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed")]
    Auth(#[from] AuthError),
    #[error("i/o error")]
    Io(#[from] io::Error),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("peer certificate does not match its advertised fingerprint")]
    FingerprintMismatch,
    #[error("transfer failed")]
    Transfer(#[from] TransferError),
    #[error("cancelled")]
    Cancelled,
    #[error("connection closed")]
    Closed,
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("file list error: {0}")]
    FileList(String),
    #[error("zlib stream error: {0}")]
    Zlib(String),
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("hub requires a password")]
    PasswordRequired,
    #[error("wrong password")]
    BadPassword,
    #[error("nick refused by hub")]
    NickRefused,
    #[error("hub is full")]
    HubFull,
    #[error("redirected to {0}")]
    Redirected(String),
    #[error("hub refused us: {0}")]
    Refused(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("peer has no free slots")]
    NoSlots,
    #[error("file not available")]
    NotAvailable,
    #[error("peer answered a different query")]
    QueryMismatch,
    #[error("peer answered from a different offset")]
    StartMismatch,
    #[error("peer answered with length {got}, wanted {wanted}")]
    LengthMismatch { wanted: u64, got: u64 },
    #[error("peer sent compressed data without being asked")]
    UnexpectedCompression,
    #[error("peer sent a zero-length file")]
    EmptyFile,
    #[error("peer sent more data than announced")]
    Overflow,
    #[error("content does not match its tiger tree hash")]
    HashMismatch,
    #[error("peer is not connected to the hub")]
    PeerNotFound,
    #[error("both peers are passive")]
    BothPassive,
    #[error("peer does not support encrypted connections")]
    EncryptionUnsupported,
    #[error("peer link closed")]
    LinkClosed,
    #[error("peer error: {0}")]
    Remote(String),
}
