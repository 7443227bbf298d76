//! Header codec: fixed 48-byte little-endian V1 layout and variable TLV-based V2 layout.
//!
//! V2 headers are followed by a data packet header whenever `message_size > 0`; both are
//! parsed and written together, and `message_size` counts the data packet header plus payload.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Size of a V1 header on the wire.
pub const V1_HEADER_LEN: usize = 48;
/// Smallest V2 header (no TLVs).
pub const V2_MIN_HEADER_LEN: usize = 8;
/// Largest V2 header the length byte may announce.
pub const V2_MAX_HEADER_LEN: usize = 252;
const V2_DATA_HEADER_MIN_LEN: usize = 8;

/// V2 header TLV carrying the acknowledged identifier.
pub const TLV_ACK_IDENTIFIER: u8 = 0x02;
/// V2 data packet TLV carrying the number of bytes still to come.
pub const DATA_TLV_REMAINING: u8 = 0x01;

/// Wire header version. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    V2,
}

bitflags! {
    /// V1 header flags. The empty set is a normal message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct V1Flags: u32 {
        const NEGATIVE_ACK = 0x0000_0001;
        const ACKNOWLEDGEMENT = 0x0000_0002;
        const WAITING = 0x0000_0004;
        const ERROR = 0x0000_0008;
        const FILE = 0x0000_0010;
        const DATA = 0x0000_0020;
        const CLOSE_SESSION = 0x0000_0040;
        const TLP_ERROR = 0x0000_0080;
        const DIRECT_HANDSHAKE = 0x0000_0100;
        const MSNSLP_INFO = 0x0100_0000;
        const MSN_OBJECT_DATA = 0x0100_0020;
        const FILE_DATA = 0x0100_0030;
    }
}

impl V1Flags {
    pub const NORMAL: Self = Self::empty();
}

bitflags! {
    /// V2 operation code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OperationCode: u8 {
        const SYN = 0x01;
        const RAK = 0x02;
    }
}

bitflags! {
    /// V2 data packet type. Values above `FIRST` mark object or file data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TfCombination: u8 {
        const FIRST = 0x01;
        const UNKNOWN = 0x02;
        const MSN_OBJECT = 0x04;
        const FILE_TRANSFER = 0x06;
    }
}

impl TfCombination {
    /// True for object/file data packets, which bypass reassembly.
    pub fn is_data(self) -> bool {
        self.bits() > Self::FIRST.bits()
    }
}

/// Error decoding or encoding a header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("truncated header: need {needed} bytes, have {available}")]
    TruncatedHeader { needed: usize, available: usize },
    #[error("invalid header length {0}")]
    InvalidHeaderLength(usize),
    #[error("invalid TLV type {tlv_type:#04x} at offset {offset}")]
    InvalidTlv { tlv_type: u8, offset: usize },
    #[error("truncated payload: need {needed} bytes, have {available}")]
    TruncatedPayload { needed: usize, available: usize },
    #[error("message size {0} does not fit the wire field")]
    MessageTooLarge(usize),
    #[error("header options exceed 252 bytes")]
    TlvOverflow,
}

/// Fixed 48-byte little-endian header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct V1Header {
    pub session_id: u32,
    pub identifier: u32,
    pub offset: u64,
    pub total_size: u64,
    pub message_size: u32,
    pub flags: V1Flags,
    pub ack_session_id: u32,
    pub ack_identifier: u32,
    pub ack_total_size: u64,
}

impl V1Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < V1_HEADER_LEN {
            return Err(FramingError::TruncatedHeader {
                needed: V1_HEADER_LEN,
                available: bytes.len(),
            });
        }
        Ok(Self {
            session_id: le_u32(bytes, 0),
            identifier: le_u32(bytes, 4),
            offset: le_u64(bytes, 8),
            total_size: le_u64(bytes, 16),
            message_size: le_u32(bytes, 24),
            flags: V1Flags::from_bits_retain(le_u32(bytes, 28)),
            ack_session_id: le_u32(bytes, 32),
            ack_identifier: le_u32(bytes, 36),
            ack_total_size: le_u64(bytes, 40),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.identifier.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.message_size.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.ack_session_id.to_le_bytes());
        out.extend_from_slice(&self.ack_identifier.to_le_bytes());
        out.extend_from_slice(&self.ack_total_size.to_le_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(V1_HEADER_LEN);
        self.write_to(&mut out);
        out
    }

    /// Acknowledgement for this header: the acked identifier moves into `ack_session_id`
    /// and the random `ack_session_id` is echoed back as `ack_identifier`.
    pub fn create_ack(&self) -> Self {
        Self {
            session_id: self.session_id,
            identifier: 0,
            offset: 0,
            total_size: self.total_size,
            message_size: 0,
            flags: V1Flags::ACKNOWLEDGEMENT,
            ack_session_id: self.identifier,
            ack_identifier: self.ack_session_id,
            ack_total_size: self.total_size,
        }
    }
}

/// Variable-length big-endian header plus its data packet header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct V2Header {
    pub operation_code: OperationCode,
    /// Data packet header length plus payload length; 0 when there is no data packet.
    pub message_size: u32,
    pub identifier: u32,
    /// Value of TLV 0x02; 0 when the message acknowledges nothing.
    pub ack_identifier: u32,
    /// Other header TLVs, kept verbatim.
    pub tlvs: BTreeMap<u8, Vec<u8>>,
    pub tf_combination: TfCombination,
    pub package_number: u16,
    pub session_id: u32,
    pub data_remaining: u64,
    /// Other data packet TLVs, kept verbatim.
    pub data_tlvs: BTreeMap<u8, Vec<u8>>,
}

impl V2Header {
    /// Length of the main header including TLVs and padding.
    pub fn header_length(&self) -> usize {
        let ack = if self.ack_identifier != 0 { 6 } else { 0 };
        V2_MIN_HEADER_LEN + pad4(ack + tlv_bytes(&self.tlvs, TLV_ACK_IDENTIFIER))
    }

    /// Length the data packet header has when one is present.
    pub fn data_packet_length(&self) -> usize {
        let remaining = if self.data_remaining > 0 { 10 } else { 0 };
        V2_DATA_HEADER_MIN_LEN + pad4(remaining + tlv_bytes(&self.data_tlvs, DATA_TLV_REMAINING))
    }

    /// Length of the data packet header on the wire (0 when `message_size == 0`).
    pub fn data_header_length(&self) -> usize {
        if self.message_size == 0 {
            0
        } else {
            self.data_packet_length()
        }
    }

    pub fn payload_size(&self) -> usize {
        (self.message_size as usize).saturating_sub(self.data_header_length())
    }

    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), FramingError> {
        if bytes.len() < V2_MIN_HEADER_LEN {
            return Err(FramingError::TruncatedHeader {
                needed: V2_MIN_HEADER_LEN,
                available: bytes.len(),
            });
        }
        let header_len = bytes[0] as usize;
        if !(V2_MIN_HEADER_LEN..=V2_MAX_HEADER_LEN).contains(&header_len) {
            return Err(FramingError::InvalidHeaderLength(header_len));
        }
        if bytes.len() < header_len {
            return Err(FramingError::TruncatedHeader {
                needed: header_len,
                available: bytes.len(),
            });
        }
        let mut header = V2Header {
            operation_code: OperationCode::from_bits_retain(bytes[1]),
            message_size: u32::from(be_u16(bytes, 2)),
            identifier: be_u32(bytes, 4),
            ..Default::default()
        };
        for (tlv_type, offset, value) in read_tlvs(&bytes[V2_MIN_HEADER_LEN..header_len], V2_MIN_HEADER_LEN)? {
            if tlv_type == TLV_ACK_IDENTIFIER {
                if value.len() != 4 {
                    return Err(FramingError::InvalidTlv { tlv_type, offset });
                }
                header.ack_identifier = be_u32(value, 0);
            } else {
                header.tlvs.insert(tlv_type, value.to_vec());
            }
        }

        let mut consumed = header_len;
        if header.message_size > 0 {
            let rest = &bytes[header_len..];
            if rest.len() < V2_DATA_HEADER_MIN_LEN {
                return Err(FramingError::TruncatedHeader {
                    needed: header_len + V2_DATA_HEADER_MIN_LEN,
                    available: bytes.len(),
                });
            }
            let data_len = rest[0] as usize;
            if data_len < V2_DATA_HEADER_MIN_LEN || data_len > header.message_size as usize {
                return Err(FramingError::InvalidHeaderLength(data_len));
            }
            if rest.len() < data_len {
                return Err(FramingError::TruncatedHeader {
                    needed: header_len + data_len,
                    available: bytes.len(),
                });
            }
            header.tf_combination = TfCombination::from_bits_retain(rest[1]);
            header.package_number = be_u16(rest, 2);
            header.session_id = be_u32(rest, 4);
            let base = header_len + V2_DATA_HEADER_MIN_LEN;
            for (tlv_type, offset, value) in read_tlvs(&rest[V2_DATA_HEADER_MIN_LEN..data_len], base)? {
                if tlv_type == DATA_TLV_REMAINING {
                    if value.len() != 8 {
                        return Err(FramingError::InvalidTlv { tlv_type, offset });
                    }
                    header.data_remaining = be_u64(value, 0);
                } else {
                    header.data_tlvs.insert(tlv_type, value.to_vec());
                }
            }
            consumed += data_len;
        }
        Ok((header, consumed))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FramingError> {
        let header_len = self.header_length();
        if header_len > V2_MAX_HEADER_LEN {
            return Err(FramingError::TlvOverflow);
        }
        let message_size =
            u16::try_from(self.message_size).map_err(|_| FramingError::MessageTooLarge(self.message_size as usize))?;
        let data_len = self.data_header_length();
        if data_len > V2_MAX_HEADER_LEN {
            return Err(FramingError::TlvOverflow);
        }
        if self.message_size > 0 && (self.message_size as usize) < data_len {
            return Err(FramingError::InvalidHeaderLength(data_len));
        }

        let mut out = Vec::with_capacity(header_len + data_len);
        out.push(header_len as u8);
        out.push(self.operation_code.bits());
        out.extend_from_slice(&message_size.to_be_bytes());
        out.extend_from_slice(&self.identifier.to_be_bytes());
        if self.ack_identifier != 0 {
            out.extend_from_slice(&[TLV_ACK_IDENTIFIER, 4]);
            out.extend_from_slice(&self.ack_identifier.to_be_bytes());
        }
        write_tlvs(&mut out, &self.tlvs, TLV_ACK_IDENTIFIER)?;
        out.resize(header_len, 0);

        if self.message_size > 0 {
            let start = out.len();
            out.push(data_len as u8);
            out.push(self.tf_combination.bits());
            out.extend_from_slice(&self.package_number.to_be_bytes());
            out.extend_from_slice(&self.session_id.to_be_bytes());
            if self.data_remaining > 0 {
                out.extend_from_slice(&[DATA_TLV_REMAINING, 8]);
                out.extend_from_slice(&self.data_remaining.to_be_bytes());
            }
            write_tlvs(&mut out, &self.data_tlvs, DATA_TLV_REMAINING)?;
            out.resize(start + data_len, 0);
        }
        Ok(out)
    }

    /// Acknowledgement for this header: `ack_identifier = identifier + message_size`, no payload.
    pub fn create_ack(&self) -> Self {
        Self {
            ack_identifier: self.identifier.wrapping_add(self.message_size),
            ..Default::default()
        }
    }
}

/// Header of either version. Accessors cover the fields both layouts share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    V1(V1Header),
    V2(V2Header),
}

impl Header {
    pub fn new(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V1 => Header::V1(V1Header::default()),
            ProtocolVersion::V2 => Header::V2(V2Header::default()),
        }
    }

    /// Parse a header from the front of `bytes`. Returns the header and the bytes consumed.
    pub fn parse(version: ProtocolVersion, bytes: &[u8]) -> Result<(Self, usize), FramingError> {
        match version {
            ProtocolVersion::V1 => V1Header::parse(bytes).map(|h| (Header::V1(h), V1_HEADER_LEN)),
            ProtocolVersion::V2 => V2Header::parse(bytes).map(|(h, n)| (Header::V2(h), n)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FramingError> {
        match self {
            Header::V1(h) => Ok(h.to_bytes()),
            Header::V2(h) => h.to_bytes(),
        }
    }

    /// Bytes `to_bytes` writes (V2: main header plus data packet header).
    pub fn header_length(&self) -> usize {
        match self {
            Header::V1(_) => V1_HEADER_LEN,
            Header::V2(h) => h.header_length() + h.data_header_length(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Header::V1(_) => ProtocolVersion::V1,
            Header::V2(_) => ProtocolVersion::V2,
        }
    }

    pub fn identifier(&self) -> u32 {
        match self {
            Header::V1(h) => h.identifier,
            Header::V2(h) => h.identifier,
        }
    }

    pub fn set_identifier(&mut self, identifier: u32) {
        match self {
            Header::V1(h) => h.identifier = identifier,
            Header::V2(h) => h.identifier = identifier,
        }
    }

    pub fn message_size(&self) -> u32 {
        match self {
            Header::V1(h) => h.message_size,
            Header::V2(h) => h.message_size,
        }
    }

    /// Payload bytes following the header(s).
    pub fn payload_size(&self) -> usize {
        match self {
            Header::V1(h) => h.message_size as usize,
            Header::V2(h) => h.payload_size(),
        }
    }

    /// Size of the whole logical message. V2 derives it from the data remaining.
    pub fn total_size(&self) -> u64 {
        match self {
            Header::V1(h) => h.total_size,
            Header::V2(h) => h.payload_size() as u64 + h.data_remaining,
        }
    }

    pub fn session_id(&self) -> u32 {
        match self {
            Header::V1(h) => h.session_id,
            Header::V2(h) => h.session_id,
        }
    }

    pub fn set_session_id(&mut self, session_id: u32) {
        match self {
            Header::V1(h) => h.session_id = session_id,
            Header::V2(h) => h.session_id = session_id,
        }
    }

    pub fn ack_identifier(&self) -> u32 {
        match self {
            Header::V1(h) => h.ack_identifier,
            Header::V2(h) => h.ack_identifier,
        }
    }

    pub fn create_ack(&self) -> Header {
        match self {
            Header::V1(h) => Header::V1(h.create_ack()),
            Header::V2(h) => Header::V2(h.create_ack()),
        }
    }

    pub fn as_v1(&self) -> Option<&V1Header> {
        match self {
            Header::V1(h) => Some(h),
            Header::V2(_) => None,
        }
    }

    pub fn as_v2(&self) -> Option<&V2Header> {
        match self {
            Header::V2(h) => Some(h),
            Header::V1(_) => None,
        }
    }
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

fn tlv_bytes(tlvs: &BTreeMap<u8, Vec<u8>>, reserved: u8) -> usize {
    tlvs.iter()
        .filter(|(t, _)| **t != 0 && **t != reserved)
        .map(|(_, v)| 2 + v.len())
        .sum()
}

fn write_tlvs(out: &mut Vec<u8>, tlvs: &BTreeMap<u8, Vec<u8>>, reserved: u8) -> Result<(), FramingError> {
    for (&tlv_type, value) in tlvs {
        if tlv_type == 0 || tlv_type == reserved {
            continue;
        }
        let len = u8::try_from(value.len()).map_err(|_| FramingError::TlvOverflow)?;
        out.push(tlv_type);
        out.push(len);
        out.extend_from_slice(value);
    }
    Ok(())
}

/// Split a TLV block into (type, absolute offset, value). Type 0 starts padding.
fn read_tlvs(block: &[u8], base: usize) -> Result<Vec<(u8, usize, &[u8])>, FramingError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < block.len() {
        let tlv_type = block[pos];
        if tlv_type == 0 {
            break;
        }
        if pos + 2 > block.len() {
            return Err(FramingError::InvalidTlv { tlv_type, offset: base + pos });
        }
        let len = block[pos + 1] as usize;
        let start = pos + 2;
        if start + len > block.len() {
            return Err(FramingError::InvalidTlv { tlv_type, offset: base + pos });
        }
        out.push((tlv_type, base + pos, &block[start..start + len]));
        pos = start + len;
    }
    Ok(out)
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

pub(crate) fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_u64(b: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    u64::from_be_bytes(buf)
}
