//! Signaling messages: the SIP-like text negotiation carried in session 0 payloads.
//!
//! Layout is a start line, `Name: value` headers, a blank line, then a body of
//! `Key: value` lines terminated by `\r\n\0`. `Content-Length` is always recomputed.

use uuid::Uuid;

const MAX_HEADERS: usize = 32;

/// Content type of a session close (BYE) body.
pub const SESSION_CLOSE_CONTENT_TYPE: &str = "application/x-msnmsgr-sessionclosebody";
/// Content type of an invitation body.
pub const SESSION_REQUEST_CONTENT_TYPE: &str = "application/x-msnmsgr-sessionreqbody";

#[derive(Debug, thiserror::Error)]
pub enum SlpError {
    #[error("signaling payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("missing start line")]
    MissingStartLine,
    #[error("malformed headers: {0}")]
    Headers(#[from] httparse::Error),
    #[error("header block not terminated")]
    IncompleteHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlpMessage {
    start_line: String,
    headers: Vec<(String, String)>,
    body: Vec<(String, String)>,
}

impl SlpMessage {
    /// Build a request such as `INVITE` or `BYE` from `from` to `to`.
    pub fn request(method: &str, to: &str, from: &str, call_id: Uuid, cseq: u32, content_type: &str) -> Self {
        let branch = format_guid(Uuid::new_v4());
        Self {
            start_line: format!("{method} MSNMSGR:{to} MSNSLP/1.0"),
            headers: vec![
                ("To".into(), format!("<msnmsgr:{to}>")),
                ("From".into(), format!("<msnmsgr:{from}>")),
                ("Via".into(), format!("MSNSLP/1.0/TLP ;branch={branch}")),
                ("CSeq".into(), cseq.to_string()),
                ("Call-ID".into(), format_guid(call_id)),
                ("Max-Forwards".into(), "0".into()),
                ("Content-Type".into(), content_type.into()),
            ],
            body: Vec::new(),
        }
    }

    /// Session close request sent when a transfer completes.
    pub fn bye(to: &str, from: &str, call_id: Uuid, session_id: u32) -> Self {
        Self::request("BYE", to, from, call_id, 0, SESSION_CLOSE_CONTENT_TYPE)
            .with_body_value("SessionID", session_id.to_string())
    }

    pub fn with_body_value(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_body_value(key, value);
        self
    }

    pub fn set_body_value(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.body.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(entry) => entry.1 = value,
            None => self.body.push((key.to_string(), value)),
        }
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// Request method, or `None` for a response (`MSNSLP/1.0 200 OK`).
    pub fn method(&self) -> Option<&str> {
        let first = self.start_line.split(' ').next()?;
        if first.starts_with("MSNSLP/") {
            None
        } else {
            Some(first)
        }
    }

    /// Status code of a response.
    pub fn status_code(&self) -> Option<u16> {
        let mut parts = self.start_line.split(' ');
        if !parts.next()?.starts_with("MSNSLP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_value(&self, key: &str) -> Option<&str> {
        self.body
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn call_id(&self) -> Option<Uuid> {
        self.header("Call-ID").and_then(|v| Uuid::parse_str(v.trim()).ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn session_id(&self) -> Option<u32> {
        self.body_value("SessionID").and_then(|v| v.trim().parse().ok())
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut body = String::new();
        for (k, v) in &self.body {
            body.push_str(k);
            body.push_str(": ");
            body.push_str(v);
            body.push_str("\r\n");
        }
        body.push_str("\r\n");
        let mut out = body.into_bytes();
        out.push(0);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body = self.body_bytes();
        let mut out = String::new();
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&body);
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SlpError> {
        let line_end = bytes
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(SlpError::MissingStartLine)?;
        let start_line = std::str::from_utf8(&bytes[..line_end])?.trim().to_string();
        if start_line.is_empty() {
            return Err(SlpError::MissingStartLine);
        }

        let rest = &bytes[line_end + 2..];
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (consumed, parsed) = match httparse::parse_headers(rest, &mut raw)? {
            httparse::Status::Complete(done) => done,
            httparse::Status::Partial => return Err(SlpError::IncompleteHeaders),
        };
        let mut headers = Vec::with_capacity(parsed.len());
        for h in parsed {
            headers.push((h.name.to_string(), std::str::from_utf8(h.value)?.trim().to_string()));
        }

        let mut body = &rest[consumed..];
        if let Some((_, len)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("Content-Length")) {
            let len: usize = len.parse().map_err(|_| SlpError::InvalidContentLength)?;
            body = &body[..len.min(body.len())];
        }
        let body_text = std::str::from_utf8(body)?.trim_end_matches('\0');
        let body = body_text
            .split("\r\n")
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Ok(Self {
            start_line,
            headers,
            body,
        })
    }
}

/// `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}` in upper case.
pub fn format_guid(id: Uuid) -> String {
    format!("{{{}}}", id.hyphenated().to_string().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bye_roundtrip() {
        let call = Uuid::new_v4();
        let bye = SlpMessage::bye("alice@example.com", "bob@example.com", call, 42);
        let bytes = bye.to_bytes();
        assert!(bytes.ends_with(b"\r\n\0"));
        let parsed = SlpMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, {
            let mut expected = bye.clone();
            expected.headers.push(("Content-Length".into(), (parsed.body_bytes().len()).to_string()));
            expected
        });
        assert_eq!(parsed.method(), Some("BYE"));
        assert_eq!(parsed.call_id(), Some(call));
        assert_eq!(parsed.session_id(), Some(42));
        assert_eq!(parsed.content_type(), Some(SESSION_CLOSE_CONTENT_TYPE));
    }

    #[test]
    fn content_length_counts_body() {
        let msg = SlpMessage::request("INVITE", "a", "b", Uuid::nil(), 0, SESSION_REQUEST_CONTENT_TYPE)
            .with_body_value("AppID", "2");
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        // "AppID: 2\r\n" + "\r\n" + "\0"
        assert!(text.contains("Content-Length: 13\r\n\r\n"));
    }

    #[test]
    fn parse_response() {
        let raw = b"MSNSLP/1.0 200 OK\r\nTo: <msnmsgr:a>\r\nCall-ID: {00000000-0000-0000-0000-000000000001}\r\nContent-Length: 17\r\n\r\nSessionID: 7\r\n\r\n\0";
        let msg = SlpMessage::parse(raw).unwrap();
        assert_eq!(msg.method(), None);
        assert_eq!(msg.status_code(), Some(200));
        assert_eq!(msg.session_id(), Some(7));
        assert_eq!(msg.call_id(), Some(Uuid::from_u128(1)));
    }

    #[test]
    fn guid_format() {
        let id = Uuid::from_u128(0x5D3E02AB_6190_11D3_BBBB_00C04F795683);
        assert_eq!(format_guid(id), "{5D3E02AB-6190-11D3-BBBB-00C04F795683}");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(SlpMessage::parse(b"no line break"), Err(SlpError::MissingStartLine)));
        assert!(matches!(
            SlpMessage::parse(b"INVITE x MSNSLP/1.0\r\nTo: a\r\n"),
            Err(SlpError::IncompleteHeaders)
        ));
    }
}
