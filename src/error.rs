use std::io;
use thiserror::Error;

/// Errors surfaced by the storage engine.
#[derive(Error, Debug)]
pub enum LsmError {
    #[error("failed to initialize database directory: {0}")]
    DirectoryInit(io::Error),

    #[error("WAL write failed: {0}")]
    WalIo(io::Error),

    #[error("WAL record corrupted during replay: {0}")]
    WalCorruption(String),

    #[error("SSTable corrupted: {0}")]
    SstableCorruption(String),

    #[error("value serialization failed: {0}")]
    Serialization(String),

    #[error("{kind} exceeds 32 bytes once UTF-8 encoded: {value:?}")]
    IdentifierTooLong { kind: &'static str, value: String },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LsmError>;
