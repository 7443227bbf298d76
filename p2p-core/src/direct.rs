//! Direct-connection framing: length-prefix (4 bytes LE) + header + payload, no footer.

use uuid::Uuid;

use crate::header::{FramingError, Header, ProtocolVersion, V1Flags, V1Header};
use crate::message::Message;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Frame the connecting side sends before its handshake.
pub const HANDSHAKE_PREAMBLE: [u8; 8] = [0x04, 0x00, 0x00, 0x00, b'f', b'o', b'o', 0x00];

/// Encode a message into a single frame: 4 bytes LE length + header + payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = msg.body_bytes()?;
    encode_raw(&body)
}

/// Frame arbitrary bytes (V2 handshake nonce).
pub fn encode_raw(body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Error encoding a message into a frame (header or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Framing(#[from] FramingError),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame body and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes or too large).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

/// True when a decoded frame body is the preamble.
pub fn is_preamble(frame: &[u8]) -> bool {
    frame == &HANDSHAKE_PREAMBLE[LEN_SIZE..]
}

/// V1 handshake: a `DirectHandshake` message carrying the nonce in its last 16 header bytes.
pub fn handshake_message_v1(nonce: Uuid) -> Message {
    let b = nonce.to_bytes_le();
    let mut total = [0u8; 8];
    total.copy_from_slice(&b[8..16]);
    Message::from_header(Header::V1(V1Header {
        flags: V1Flags::DIRECT_HANDSHAKE,
        ack_session_id: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        ack_identifier: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        ack_total_size: u64::from_le_bytes(total),
        ..Default::default()
    }))
}

pub fn nonce_from_v1(header: &V1Header) -> Uuid {
    let mut b = [0u8; 16];
    b[0..4].copy_from_slice(&header.ack_session_id.to_le_bytes());
    b[4..8].copy_from_slice(&header.ack_identifier.to_le_bytes());
    b[8..16].copy_from_slice(&header.ack_total_size.to_le_bytes());
    Uuid::from_bytes_le(b)
}

/// V2 handshake frames are the bare 16-byte nonce.
pub fn parse_v2_handshake(frame: &[u8]) -> Option<Uuid> {
    let bytes: [u8; 16] = frame.try_into().ok()?;
    Some(Uuid::from_bytes_le(bytes))
}

/// Handshake frame(s) for `version`, optionally preceded by the preamble.
pub fn encode_handshake(version: ProtocolVersion, nonce: Uuid, with_preamble: bool) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::new();
    if with_preamble {
        out.extend_from_slice(&HANDSHAKE_PREAMBLE);
    }
    match version {
        ProtocolVersion::V1 => out.extend_from_slice(&encode_frame(&handshake_message_v1(nonce))?),
        ProtocolVersion::V2 => out.extend_from_slice(&encode_raw(&nonce.to_bytes_le())?),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Message {
        let mut m = Message::new(ProtocolVersion::V1);
        m.set_payload(vec![7; len]);
        m.set_footer(2);
        m
    }

    #[test]
    fn frame_has_no_footer() {
        let msg = sample(10);
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame.len(), 4 + 48 + 10);
        assert_eq!(&frame[..4], &58u32.to_le_bytes());
        let (body, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        let parsed = Message::parse(ProtocolVersion::V1, body).unwrap();
        assert_eq!(parsed.payload(), msg.payload());
        assert_eq!(parsed.footer(), 0);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample(10)).unwrap();
        assert_eq!(decode_frame(&frame[..2]), Err(FrameDecodeError::NeedMore));
        assert_eq!(decode_frame(&frame[..super::LEN_SIZE]), Err(FrameDecodeError::NeedMore));
        assert_eq!(decode_frame(&frame[..frame.len() - 1]), Err(FrameDecodeError::NeedMore));
    }

    #[test]
    fn oversized_length_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert_eq!(decode_frame(&bytes), Err(FrameDecodeError::TooLarge));
    }

    #[test]
    fn multiple_frames() {
        let fa = encode_frame(&sample(3)).unwrap();
        let fb = encode_raw(b"abcd").unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&fb);
        let (_, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (b2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(b2, b"abcd");
    }

    #[test]
    fn v1_handshake_carries_nonce() {
        let nonce = Uuid::new_v4();
        let wire = encode_handshake(ProtocolVersion::V1, nonce, true).unwrap();
        assert_eq!(&wire[..8], &HANDSHAKE_PREAMBLE);
        let (pre, n) = decode_frame(&wire).unwrap();
        assert!(is_preamble(pre));
        let (body, _) = decode_frame(&wire[n..]).unwrap();
        assert_eq!(&body[32..48], &nonce.to_bytes_le());
        let msg = Message::parse(ProtocolVersion::V1, body).unwrap();
        assert_eq!(nonce_from_v1(msg.header().as_v1().unwrap()), nonce);
    }

    #[test]
    fn v2_handshake_is_raw_nonce() {
        let nonce = Uuid::new_v4();
        let wire = encode_handshake(ProtocolVersion::V2, nonce, false).unwrap();
        let (body, _) = decode_frame(&wire).unwrap();
        assert_eq!(parse_v2_handshake(body), Some(nonce));
        assert_eq!(parse_v2_handshake(&body[..15]), None);
    }
}
