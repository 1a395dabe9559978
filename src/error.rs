use std::path::PathBuf;

use crate::frame::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable ({}): {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source {}: missing column '{column}'", .path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("record at line {line}: {detail}")]
    Record { line: usize, detail: String },

    #[error("source io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("channel io: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(String),
}

/// Errors that end a publisher or subscriber run.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
