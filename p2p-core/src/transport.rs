//! Transport seam: the session hands framed bytes to a host-provided transport.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::session::MessageSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Messages are wrapped in the relay's MIME envelope.
    Relay,
    /// Messages are length-prefixed on a peer socket.
    Direct,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Outbound half of a connection. Inbound bytes are pushed into the session by the host
/// (`MessageSession::handle_relay_bytes` / `handle_direct_frame`).
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Queue already-framed bytes for sending.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn disconnect(&self);
}

/// Opens direct connections for a session. Implementations must report the outcome later
/// through `on_direct_connected` / `on_direct_failed`, never from inside `connect`/`listen`.
pub trait DirectConnector: Send + Sync {
    fn connect(&self, session: &Arc<MessageSession>, addr: SocketAddr) -> Result<Arc<dyn Transport>, TransportError>;

    fn listen(&self, session: &Arc<MessageSession>, addr: SocketAddr) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Identity comparison that ignores vtable pointers.
pub fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}
