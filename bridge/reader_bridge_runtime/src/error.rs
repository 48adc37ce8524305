use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced across the native side of the reader bridge.
///
/// Content-server request failures never show up here; they are answered with
/// HTTP statuses instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind content server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("renderer channel closed")]
    RendererClosed,

    #[error("UI context rejected task: {0}")]
    UiContext(String),

    #[error("frame too large: {len} > {cap}")]
    FrameTooLarge { len: usize, cap: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
