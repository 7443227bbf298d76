//! Relay framing: messages nested in the relay server's MIME-style message body.

use crate::header::{FramingError, ProtocolVersion};
use crate::message::Message;

pub const P2P_CONTENT_TYPE: &str = "application/x-msnmsgrp2p";
const MAX_HEADERS: usize = 16;

/// Routing headers of a relay-wrapped message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHeaders {
    pub destination: String,
    pub source: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed relay headers: {0}")]
    Headers(#[from] httparse::Error),
    #[error("relay header block not terminated")]
    Incomplete,
    #[error("unexpected content type {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("missing P2P-Dest header")]
    MissingDestination,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Wrap a message (header, payload and V1 footer) for the relay.
pub fn wrap(message: &Message, destination: &str, source: Option<&str>) -> Result<Vec<u8>, FramingError> {
    let mut head = format!("MIME-Version: 1.0\r\nContent-Type: {P2P_CONTENT_TYPE}\r\nP2P-Dest: {destination}\r\n");
    if let Some(src) = source {
        head.push_str(&format!("P2P-Src: {src}\r\n"));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(&message.to_bytes()?);
    Ok(out)
}

pub fn unwrap(version: ProtocolVersion, bytes: &[u8]) -> Result<(RelayHeaders, Message), RelayError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (consumed, headers) = match httparse::parse_headers(bytes, &mut raw)? {
        httparse::Status::Complete(done) => done,
        httparse::Status::Partial => return Err(RelayError::Incomplete),
    };
    let find = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
    };
    let content_type = find("Content-Type");
    if content_type.as_deref() != Some(P2P_CONTENT_TYPE) {
        return Err(RelayError::UnexpectedContentType(content_type));
    }
    let destination = find("P2P-Dest").ok_or(RelayError::MissingDestination)?;
    let relay_headers = RelayHeaders {
        destination,
        source: find("P2P-Src"),
    };
    let message = Message::parse(version, &bytes[consumed..])?;
    Ok((relay_headers, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let mut msg = Message::new(ProtocolVersion::V1);
        msg.set_payload(b"hello".to_vec());
        msg.set_footer(1);
        let wire = wrap(&msg, "bob@example.com", Some("alice@example.com")).unwrap();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("MIME-Version: 1.0\r\nContent-Type: application/x-msnmsgrp2p\r\n"));
        let (headers, parsed) = unwrap(ProtocolVersion::V1, &wire).unwrap();
        assert_eq!(headers.destination, "bob@example.com");
        assert_eq!(headers.source.as_deref(), Some("alice@example.com"));
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_other_content() {
        let wire = b"MIME-Version: 1.0\r\nContent-Type: text/plain\r\n\r\nhi";
        assert!(matches!(
            unwrap(ProtocolVersion::V1, wire),
            Err(RelayError::UnexpectedContentType(Some(ct))) if ct == "text/plain"
        ));
    }

    #[test]
    fn truncated_envelope_is_framing_error() {
        let mut msg = Message::new(ProtocolVersion::V2);
        msg.set_payload(vec![1, 2, 3]);
        let mut wire = wrap(&msg, "x", None).unwrap();
        wire.truncate(wire.len() - 2);
        assert!(matches!(unwrap(ProtocolVersion::V2, &wire), Err(RelayError::Framing(_))));
    }
}
