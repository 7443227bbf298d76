//! Message envelope: header, footer and payload, with acks and splitting.

use std::sync::OnceLock;

use rand::Rng;

use crate::header::{FramingError, Header, OperationCode, ProtocolVersion, TfCombination, V1Flags};
use crate::slp::SlpMessage;

/// Largest chunk sent over a relay transport.
pub const RELAY_MAX_CHUNK_SIZE: usize = 1202;
/// Largest V1 chunk sent over a direct connection.
pub const DIRECT_MAX_CHUNK_SIZE: usize = 1352;
/// Largest V2 payload per chunk, excluding the data packet header.
pub const V2_MAX_CHUNK_SIZE: usize = 1202;

const FOOTER_LEN: usize = 4;

/// What a message is, decided once from its header and matched exhaustively by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// V1 direct-connection handshake carrying the nonce.
    Handshake,
    /// Acknowledgement without payload.
    Ack,
    /// Session 0 traffic for the signaling layer.
    Signaling,
    /// Traffic for a transfer session.
    Data,
}

/// One protocol unit. The header's size fields always describe the payload it carries.
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    footer: u32,
    payload: Vec<u8>,
    nested: OnceLock<Option<SlpMessage>>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.footer == other.footer && self.payload == other.payload
    }
}

impl Eq for Message {}

impl Message {
    pub fn new(version: ProtocolVersion) -> Self {
        Self::from_header(Header::new(version))
    }

    pub fn from_header(header: Header) -> Self {
        Self {
            header,
            footer: 0,
            payload: Vec::new(),
            nested: OnceLock::new(),
        }
    }

    /// Session 0 message carrying a signaling payload. V2 requests an acknowledgement.
    pub fn signaling(version: ProtocolVersion, slp: SlpMessage) -> Self {
        let mut msg = Self::new(version);
        if let Header::V2(h) = &mut msg.header {
            h.operation_code = OperationCode::RAK;
            h.tf_combination = TfCombination::FIRST;
        }
        msg.set_nested(slp);
        msg
    }

    pub fn version(&self) -> ProtocolVersion {
        self.header.version()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Edit the header, then bring `message_size` (and V1 `total_size`) back in line with the payload.
    pub fn update_header<F: FnOnce(&mut Header)>(&mut self, f: F) {
        f(&mut self.header);
        self.sync_sizes();
    }

    pub fn footer(&self) -> u32 {
        self.footer
    }

    pub fn set_footer(&mut self, footer: u32) {
        self.footer = footer;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
        self.nested = OnceLock::new();
        self.sync_sizes();
    }

    /// Replace the payload with a serialized signaling message and cache it.
    pub fn set_nested(&mut self, slp: SlpMessage) {
        self.payload = slp.to_bytes();
        self.sync_sizes();
        self.nested = OnceLock::new();
        let _ = self.nested.set(Some(slp));
    }

    /// Signaling message carried in the payload, parsed on first access.
    pub fn nested(&self) -> Option<&SlpMessage> {
        self.nested
            .get_or_init(|| {
                if self.is_signaling_payload() {
                    SlpMessage::parse(&self.payload).ok()
                } else {
                    None
                }
            })
            .as_ref()
    }

    fn sync_sizes(&mut self) {
        let len = self.payload.len();
        match &mut self.header {
            Header::V1(h) => {
                h.message_size = len as u32;
                if h.total_size < len as u64 {
                    h.total_size = len as u64;
                }
            }
            Header::V2(h) => {
                h.message_size = if len == 0 {
                    0
                } else {
                    (h.data_packet_length() + len) as u32
                };
            }
        }
    }

    pub fn session_id(&self) -> u32 {
        self.header.session_id()
    }

    pub fn identifier(&self) -> u32 {
        self.header.identifier()
    }

    /// V1 byte offset of this fragment; always 0 for V2.
    pub fn offset(&self) -> u64 {
        self.header.as_v1().map_or(0, |h| h.offset)
    }

    pub fn total_size(&self) -> u64 {
        self.header.total_size()
    }

    /// V2 bytes still to come after this message; always 0 for V1.
    pub fn data_remaining(&self) -> u64 {
        self.header.as_v2().map_or(0, |h| h.data_remaining)
    }

    pub fn is_signaling_payload(&self) -> bool {
        if self.header.message_size() == 0 || self.header.session_id() != 0 {
            return false;
        }
        match &self.header {
            Header::V1(h) => h.flags == V1Flags::NORMAL || h.flags == V1Flags::MSNSLP_INFO,
            Header::V2(h) => h.tf_combination.is_empty() || h.tf_combination == TfCombination::FIRST,
        }
    }

    /// True for transfer payload chunks (as opposed to the preparation message).
    pub fn is_data_chunk(&self) -> bool {
        match &self.header {
            Header::V1(h) => h.flags.contains(V1Flags::DATA),
            Header::V2(h) => h.tf_combination.is_data(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.header {
            Header::V1(h) if h.flags.contains(V1Flags::DIRECT_HANDSHAKE) => MessageKind::Handshake,
            Header::V1(h) if h.flags.contains(V1Flags::ACKNOWLEDGEMENT) => MessageKind::Ack,
            Header::V2(h) if h.message_size == 0 && h.ack_identifier != 0 => MessageKind::Ack,
            _ if self.header.session_id() != 0 => MessageKind::Data,
            _ => MessageKind::Signaling,
        }
    }

    pub fn is_error(&self) -> bool {
        self.header
            .as_v1()
            .is_some_and(|h| h.flags.intersects(V1Flags::ERROR | V1Flags::TLP_ERROR))
    }

    pub fn is_close(&self) -> bool {
        self.header
            .as_v1()
            .is_some_and(|h| h.flags.contains(V1Flags::CLOSE_SESSION))
    }

    /// Whether the receiver must acknowledge this (complete) message.
    pub fn requires_ack(&self) -> bool {
        match &self.header {
            Header::V1(h) => {
                !h.flags.intersects(V1Flags::ACKNOWLEDGEMENT | V1Flags::NEGATIVE_ACK)
                    && h.message_size > 0
                    && h.offset + u64::from(h.message_size) == h.total_size
            }
            Header::V2(h) => h.operation_code.contains(OperationCode::RAK),
        }
    }

    pub fn create_ack(&self) -> Message {
        Message::from_header(self.header.create_ack())
    }

    /// Value an acknowledgement of this message will carry in its `ack_identifier`.
    pub fn expected_ack_key(&self) -> u32 {
        match &self.header {
            Header::V1(h) => h.ack_session_id,
            Header::V2(h) => h.identifier.wrapping_add(h.message_size),
        }
    }

    /// Split into chunks carrying at most `max_chunk_size` payload bytes each.
    pub fn split(&self, max_chunk_size: usize) -> Vec<Message> {
        let max = max_chunk_size.max(1);
        if self.payload.len() <= max {
            return vec![self.clone()];
        }
        match &self.header {
            Header::V1(parent) => {
                let mut rng = rand::thread_rng();
                let mut offset = parent.offset;
                self.payload
                    .chunks(max)
                    .map(|piece| {
                        let mut h = parent.clone();
                        h.offset = offset;
                        h.message_size = piece.len() as u32;
                        h.ack_session_id = rng.gen_range(1..=u32::MAX);
                        offset += piece.len() as u64;
                        Message {
                            header: Header::V1(h),
                            footer: self.footer,
                            payload: piece.to_vec(),
                            nested: OnceLock::new(),
                        }
                    })
                    .collect()
            }
            Header::V2(parent) => {
                let total = self.payload.len() as u64;
                let mut sent = 0u64;
                let mut identifier = parent.identifier;
                let mut out = Vec::new();
                for (i, piece) in self.payload.chunks(max).enumerate() {
                    let mut h = parent.clone();
                    sent += piece.len() as u64;
                    if i > 0 {
                        h.operation_code = OperationCode::empty();
                        h.ack_identifier = 0;
                        h.tlvs.clear();
                        h.tf_combination.remove(TfCombination::FIRST);
                    }
                    h.identifier = identifier;
                    h.data_remaining = parent.data_remaining + (total - sent);
                    h.message_size = (h.data_packet_length() + piece.len()) as u32;
                    identifier = identifier.wrapping_add(h.message_size);
                    out.push(Message {
                        header: Header::V2(h),
                        footer: 0,
                        payload: piece.to_vec(),
                        nested: OnceLock::new(),
                    });
                }
                out
            }
        }
    }

    /// Header and payload, without the footer.
    pub fn body_bytes(&self) -> Result<Vec<u8>, FramingError> {
        let mut out = self.header.to_bytes()?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Wire form: header, payload and (V1) the big-endian footer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FramingError> {
        let mut out = self.body_bytes()?;
        if self.version() == ProtocolVersion::V1 {
            out.extend_from_slice(&self.footer.to_be_bytes());
        }
        Ok(out)
    }

    /// Parse one message. A V1 footer is read when four bytes follow the payload.
    pub fn parse(version: ProtocolVersion, bytes: &[u8]) -> Result<Message, FramingError> {
        let (header, consumed) = Header::parse(version, bytes)?;
        let size = header.payload_size();
        let end = consumed + size;
        if bytes.len() < end {
            return Err(FramingError::TruncatedPayload {
                needed: end,
                available: bytes.len(),
            });
        }
        let footer = if version == ProtocolVersion::V1 && bytes.len() >= end + FOOTER_LEN {
            crate::header::be_u32(bytes, end)
        } else {
            0
        };
        Ok(Message {
            header,
            footer,
            payload: bytes[consumed..end].to_vec(),
            nested: OnceLock::new(),
        })
    }
}

pub(crate) fn random_nonzero() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::V1Header;

    fn v1_data(len: usize) -> Message {
        let mut m = Message::new(ProtocolVersion::V1);
        m.update_header(|h| {
            if let Header::V1(h) = h {
                h.session_id = 5;
                h.identifier = 100;
                h.flags = V1Flags::MSN_OBJECT_DATA;
                h.ack_session_id = 77;
            }
        });
        m.set_footer(12);
        m.set_payload((0..len).map(|i| i as u8).collect());
        m
    }

    fn v2_signaling(len: usize) -> Message {
        let mut m = Message::new(ProtocolVersion::V2);
        m.update_header(|h| {
            if let Header::V2(h) = h {
                h.identifier = 1000;
                h.operation_code = OperationCode::RAK;
                h.tf_combination = TfCombination::FIRST;
                h.package_number = 3;
                h.ack_identifier = 55;
            }
        });
        m.set_payload(vec![0xAB; len]);
        m
    }

    #[test]
    fn set_payload_updates_sizes() {
        let m = v1_data(300);
        assert_eq!(m.header().message_size(), 300);
        assert_eq!(m.total_size(), 300);

        let m = v2_signaling(300);
        assert_eq!(m.header().message_size(), 308);
        assert_eq!(m.header().payload_size(), 300);
        assert_eq!(m.total_size(), 300);
    }

    #[test]
    fn v2_empty_payload_has_no_data_packet() {
        let mut m = v2_signaling(10);
        m.set_payload(Vec::new());
        assert_eq!(m.header().message_size(), 0);
    }

    #[test]
    fn roundtrip_with_footer() {
        let m = v1_data(50);
        let bytes = m.to_bytes().unwrap();
        assert_eq!(bytes.len(), 48 + 50 + 4);
        assert_eq!(&bytes[98..], &12u32.to_be_bytes());
        assert_eq!(Message::parse(ProtocolVersion::V1, &bytes).unwrap(), m);
    }

    #[test]
    fn v1_parse_without_footer() {
        let m = v1_data(50);
        let bytes = m.body_bytes().unwrap();
        let parsed = Message::parse(ProtocolVersion::V1, &bytes).unwrap();
        assert_eq!(parsed.footer(), 0);
        assert_eq!(parsed.payload(), m.payload());
    }

    #[test]
    fn truncated_payload() {
        let bytes = v1_data(50).to_bytes().unwrap();
        assert!(matches!(
            Message::parse(ProtocolVersion::V1, &bytes[..60]),
            Err(FramingError::TruncatedPayload { needed: 98, available: 60 })
        ));
    }

    #[test]
    fn v2_roundtrip() {
        let m = v2_signaling(64);
        let bytes = m.to_bytes().unwrap();
        assert_eq!(Message::parse(ProtocolVersion::V2, &bytes).unwrap(), m);
    }

    #[test]
    fn split_small_is_identity() {
        let m = v1_data(1202);
        let parts = m.split(RELAY_MAX_CHUNK_SIZE);
        assert_eq!(parts, vec![m]);
    }

    #[test]
    fn split_v1_offsets() {
        let m = v1_data(3000);
        let parts = m.split(1202);
        assert_eq!(parts.len(), 3);
        let offsets: Vec<u64> = parts.iter().map(Message::offset).collect();
        assert_eq!(offsets, vec![0, 1202, 2404]);
        for p in &parts {
            let h = p.header().as_v1().unwrap();
            assert_eq!(h.total_size, 3000);
            assert_eq!(h.identifier, 100);
            assert_eq!(h.flags, V1Flags::MSN_OBJECT_DATA);
            assert_ne!(h.ack_session_id, 0);
            assert_eq!(p.footer(), 12);
        }
        assert_eq!(parts[2].payload().len(), 596);
        let joined: Vec<u8> = parts.iter().flat_map(|p| p.payload().to_vec()).collect();
        assert_eq!(joined, m.payload());
    }

    #[test]
    fn split_v2_chains_identifiers() {
        let m = v2_signaling(3000);
        let parts = m.split(V2_MAX_CHUNK_SIZE);
        assert_eq!(parts.len(), 3);
        let first = parts[0].header().as_v2().unwrap();
        assert_eq!(first.operation_code, OperationCode::RAK);
        assert_eq!(first.tf_combination, TfCombination::FIRST);
        assert_eq!(first.ack_identifier, 55);
        assert_eq!(first.data_remaining, 1798);
        for i in 1..parts.len() {
            let prev = parts[i - 1].header();
            let h = parts[i].header().as_v2().unwrap();
            assert_eq!(h.identifier, prev.identifier() + prev.message_size());
            assert!(h.operation_code.is_empty());
            assert!(h.tf_combination.is_empty());
            assert_eq!(h.ack_identifier, 0);
            assert_eq!(h.package_number, 3);
        }
        assert_eq!(parts[1].data_remaining(), 596);
        assert_eq!(parts[2].data_remaining(), 0);
        assert_eq!(parts[2].header().message_size(), 8 + 596);
    }

    #[test]
    fn kinds() {
        assert_eq!(v1_data(10).kind(), MessageKind::Data);
        assert_eq!(v1_data(10).create_ack().kind(), MessageKind::Ack);
        assert_eq!(v2_signaling(10).kind(), MessageKind::Signaling);
        assert_eq!(v2_signaling(10).create_ack().kind(), MessageKind::Ack);
        let hs = Message::from_header(Header::V1(V1Header {
            flags: V1Flags::DIRECT_HANDSHAKE,
            ..Default::default()
        }));
        assert_eq!(hs.kind(), MessageKind::Handshake);
    }

    #[test]
    fn signaling_payload_detection() {
        assert!(v2_signaling(10).is_signaling_payload());
        assert!(!v1_data(10).is_signaling_payload());
        let mut m = Message::new(ProtocolVersion::V1);
        m.set_payload(vec![1]);
        assert!(m.is_signaling_payload());
        m.update_header(|h| h.set_session_id(9));
        assert!(!m.is_signaling_payload());
    }

    #[test]
    fn ack_keys_match() {
        let m = v1_data(10);
        let ack = m.create_ack();
        assert_eq!(ack.header().ack_identifier(), m.expected_ack_key());

        let m = v2_signaling(10);
        let ack = m.create_ack();
        assert_eq!(ack.header().ack_identifier(), m.expected_ack_key());
    }

    #[test]
    fn requires_ack_only_when_complete() {
        let m = v1_data(3000);
        let parts = m.split(1202);
        assert!(!parts[0].requires_ack());
        assert!(parts[2].requires_ack());
        assert!(!m.create_ack().requires_ack());
        assert!(v2_signaling(5).requires_ack());
    }

    #[test]
    fn error_flags() {
        let mut m = v1_data(1);
        assert!(!m.is_error());
        m.update_header(|h| {
            if let Header::V1(h) = h {
                h.flags |= V1Flags::TLP_ERROR;
            }
        });
        assert!(m.is_error());
    }
}
