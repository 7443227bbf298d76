//! Crate-level error.

use crate::direct::{FrameDecodeError, FrameEncodeError};
use crate::header::FramingError;
use crate::relay::RelayError;
use crate::slp::SlpError;
use crate::transfer::TransferError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("framing: {0}")]
    Framing(#[from] FramingError),
    #[error("relay: {0}")]
    Relay(#[from] RelayError),
    #[error("frame encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("signaling: {0}")]
    Slp(#[from] SlpError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("session {0} already has a transfer")]
    DuplicateSession(u32),
    #[error("no direct connector configured")]
    NoConnector,
    #[error("message session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
