//! P2P transfer layer: V1/V2 header codec, message envelope, reassembly, message and transfer sessions.
//! Host-driven: no sockets; the host supplies transports and feeds inbound bytes.

pub mod apps;
pub mod config;
pub mod direct;
pub mod error;
pub mod header;
pub mod message;
pub mod pool;
pub mod relay;
pub mod session;
pub mod slp;
pub mod transfer;
pub mod transport;

pub use apps::AppRegistry;
pub use config::SessionConfig;
pub use direct::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use error::{Error, Result};
pub use header::{FramingError, Header, OperationCode, ProtocolVersion, TfCombination, V1Flags, V1Header, V2Header};
pub use message::{Message, MessageKind};
pub use pool::MessagePool;
pub use session::{AckCallback, IdentifierSequence, MessageHandler, MessageSession, SessionEvent};
pub use slp::SlpMessage;
pub use transfer::{AbortReason, DataStream, TransferError, TransferSession, TransferSetup, TransferState};
pub use transport::{DirectConnector, Transport, TransportError, TransportKind};
