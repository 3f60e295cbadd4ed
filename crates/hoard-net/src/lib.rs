//! Hoard network layer.
//!
//! A length-prefixed binary protocol multiplexing several services over one
//! TCP connection, with optional AES-GCM framing.
//!
//! ```text
//! frame:  [len: u32 LE][header: 4][body]
//! header: [service | 0x80 on responses][message type][message id: u16 LE]
//! ```

use thiserror::Error;

pub mod client;
pub mod crypto;
pub mod protocol;
pub mod server;

pub use client::NetworkClient;
pub use crypto::CryptoKey;
pub use protocol::{
    BinaryReader, BinaryWriter, CacheMessage, MessageHeader, ServiceId, SessionMessage, StorageMessage,
    SystemMessage,
};
pub use server::{
    ClientStats, ClientUid, ConnectionId, MessageInfo, NetworkServer, NetworkServerConfig, ServerStats,
};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message truncated")]
    Truncated,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed")]
    Disconnected,

    #[error("Connection rejected")]
    Rejected,
}

pub type Result<T> = std::result::Result<T, NetworkError>;
