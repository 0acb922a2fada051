use std::io;
use std::net::SocketAddr;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listener could not be bound.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A TCP connection arrived but could not be accepted or upgraded.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Writing a frame to the peer failed.
    #[error("send to {peer} failed: {source}")]
    Send {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The peer reset the connection or violated the WebSocket protocol.
    #[error("receive from {peer} failed: {source}")]
    Receive {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}
