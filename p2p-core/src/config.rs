//! Session tuning knobs. Deserialized from the host's `[session]` table.

use std::time::Duration;

use serde::Deserialize;

use crate::header::ProtocolVersion;
use crate::message::{DIRECT_MAX_CHUNK_SIZE, RELAY_MAX_CHUNK_SIZE, V2_MAX_CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Largest V1 chunk over the relay (default 1202).
    #[serde(default = "default_relay_chunk_size")]
    pub relay_chunk_size: usize,
    /// Largest V1 chunk over a direct connection (default 1352).
    #[serde(default = "default_direct_chunk_size")]
    pub direct_chunk_size: usize,
    /// Largest V2 payload per chunk (default 1202).
    #[serde(default = "default_v2_chunk_size")]
    pub v2_chunk_size: usize,
    /// Retry queue length above which senders are slowed down (default 100).
    #[serde(default = "default_max_buffered_messages")]
    pub max_buffered_messages: usize,
    #[serde(default = "default_backpressure_delay_ms")]
    pub backpressure_delay_ms: u64,
    /// Delay between V2 data chunks (default 300 ms).
    #[serde(default = "default_v2_pacing_ms")]
    pub v2_pacing_ms: u64,
    /// Connecting side sends the handshake as soon as the socket is up.
    #[serde(default = "default_true")]
    pub auto_handshake: bool,
    /// Close the transfer stream when the transfer finishes or aborts.
    #[serde(default = "default_true")]
    pub close_stream_on_finish: bool,
}

fn default_relay_chunk_size() -> usize {
    RELAY_MAX_CHUNK_SIZE
}
fn default_direct_chunk_size() -> usize {
    DIRECT_MAX_CHUNK_SIZE
}
fn default_v2_chunk_size() -> usize {
    V2_MAX_CHUNK_SIZE
}
fn default_max_buffered_messages() -> usize {
    100
}
fn default_backpressure_delay_ms() -> u64 {
    50
}
fn default_v2_pacing_ms() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_chunk_size: default_relay_chunk_size(),
            direct_chunk_size: default_direct_chunk_size(),
            v2_chunk_size: default_v2_chunk_size(),
            max_buffered_messages: default_max_buffered_messages(),
            backpressure_delay_ms: default_backpressure_delay_ms(),
            v2_pacing_ms: default_v2_pacing_ms(),
            auto_handshake: default_true(),
            close_stream_on_finish: default_true(),
        }
    }
}

impl SessionConfig {
    pub fn backpressure_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_delay_ms)
    }

    pub fn v2_pacing(&self) -> Duration {
        Duration::from_millis(self.v2_pacing_ms)
    }

    /// Largest payload per chunk for this version and transport.
    pub fn max_chunk_size(&self, version: ProtocolVersion, direct: bool) -> usize {
        match (version, direct) {
            (ProtocolVersion::V2, _) => self.v2_chunk_size,
            (ProtocolVersion::V1, true) => self.direct_chunk_size,
            (ProtocolVersion::V1, false) => self.relay_chunk_size,
        }
    }
}
