//! # crest
//!
//! A standalone WebSocket server implementing the RFC 6455 wire protocol
//! end-to-end over plaintext TCP or TLS.
//!
//! crest owns the whole stack: it accepts TCP (or TLS) connections, performs
//! the HTTP/1.1 upgrade handshake itself, frames and reassembles messages,
//! answers control frames (ping/pong/close), enforces liveness and size
//! limits, and surfaces application-level events to a host program through
//! the [`EventHandler`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ Application ([`EventHandler`] implementation)  │
//! └────────────────┬───────────────────────────────┘
//!                  │ connect / data / disconnect events
//! ┌────────────────▼───────────────────────────────┐
//! │ Server coordinator                             │
//! │ • session registry + online accounting         │
//! │ • callback dispatch                            │
//! │ • user timers                                  │
//! └────────────────┬───────────────────────────────┘
//!                  │ one spawned pump per connection
//! ┌────────────────▼───────────────────────────────┐
//! │ Session                                        │
//! │ • upgrade handshake                            │
//! │ • fragment reassembly (bounded)                │
//! │ • ping/pong liveness with nonce correlation    │
//! └────────────────┬───────────────────────────────┘
//! ┌────────────────▼───────────────────────────────┐
//! │ Codec                                          │
//! │ • frame encoding/decoding                      │
//! │ • masking/unmasking                            │
//! │ • header parsing (FIN, RSV, OpCode)            │
//! └────────────────┬───────────────────────────────┘
//!                  │
//!           Network (TCP/TLS)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use crest::{Config, EventHandler, Server, SessionHandle};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_data_receive(&self, session: &SessionHandle, payload: Bytes) -> bool {
//!         session.send_text(payload);
//!         true
//!     }
//! }
//!
//! # async fn run() -> crest::Result<()> {
//! let mut server = Server::new(Config::default(), Echo);
//! server.run().await
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod lockfile;
#[doc(hidden)]
pub mod mask;
pub mod server;
mod session;
mod stream;
mod tls;

pub use bytes::Bytes;
pub use config::{Config, SslCertPath, Transport};
pub use frame::{Frame, OpCode};
pub use handler::{ConnectAction, EventHandler, SessionHandle};
pub use handshake::{QueryValue, Request};
pub use lockfile::LockFile;
pub use server::{Options, Server, ServerHandle};
pub use session::MAX_BUFFER;
use thiserror::Error;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, WsError>;

/// Errors that can occur while speaking the WebSocket protocol or running
/// the server.
#[derive(Error, Debug)]
pub enum WsError {
    /// Invalid frame opcode nibble.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Control frame with the FIN bit clear.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Control frame declaring an extended length or a payload over 125 bytes.
    #[error("control frame too large")]
    ControlFrameTooLarge,

    /// Reserved bits in the frame header are not zero.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Client-to-server frame arrived without a mask.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// Frame payload exceeds the configured maximum.
    #[error("frame too large")]
    FrameTooLarge,

    /// Continuation frame without a message in progress.
    #[error("invalid continuation frame")]
    InvalidContinuationFrame,

    /// New data frame while a fragmented message is still being assembled.
    #[error("invalid fragment")]
    InvalidFragment,

    /// Fragmented message exceeded the reassembly buffer bound.
    #[error("reassembly buffer full")]
    ReassemblyBufferFull,

    /// Malformed HTTP request line or headers.
    #[error("bad upgrade request")]
    BadRequest,

    /// Upgrade request larger than the single-read bound.
    #[error("upgrade request too large")]
    RequestTooLarge,

    /// Missing or empty Host header.
    #[error("missing host header")]
    MissingHost,

    /// Missing or invalid "Upgrade: websocket" header.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Missing or invalid "Connection: upgrade" header.
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// Missing Sec-WebSocket-Key header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// Sec-WebSocket-Key does not decode to a 16-byte nonce.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidSecWebSocketKey,

    /// Sec-WebSocket-Version is not 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// The server is already running.
    #[error("websocket server is already running")]
    AlreadyRunning,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS setup error.
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// Returns `true` if this is a protocol-level error (RFC 6455 violation).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOpCode(_)
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::ReservedBitsNotZero
                | Self::UnmaskedFrame
                | Self::FrameTooLarge
                | Self::InvalidContinuationFrame
                | Self::InvalidFragment
                | Self::ReassemblyBufferFull
        )
    }

    /// Returns `true` if this is a handshake error.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest
                | Self::RequestTooLarge
                | Self::MissingHost
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::MissingSecWebSocketKey
                | Self::InvalidSecWebSocketKey
                | Self::InvalidSecWebSocketVersion
        )
    }

    /// Returns `true` if this wraps an I/O error.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
