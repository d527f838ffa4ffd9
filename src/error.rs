//! Error types for the aliasing engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AliasError {
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("No free alias port after {0} attempts")]
    PortExhausted(usize),

    #[error("Link table full")]
    TableFull,

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("No such link")]
    NoSuchLink,

    #[error("Packet too large: need {needed} bytes, capacity {capacity}")]
    PacketTooLarge { needed: usize, capacity: usize },

    #[error("Rewrite skipped: {0}")]
    Rewrite(&'static str),

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AliasError>;
