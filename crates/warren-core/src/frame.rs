use bytes::{Bytes, BytesMut};

use crate::command::Command;

/// A fully-assembled frame: command, ordered headers, optional body.
///
/// Headers are an ordered `Vec` rather than a map — the wire format permits
/// duplicate keys and preserves the order they were sent in, which matters
/// for tests that round-trip an arbitrary header set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Last value for `key` — duplicate headers on the wire resolve
    /// last-write-wins.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encode this frame onto `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.extend_from_slice(b"Command: ");
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.extend_from_slice(b"\n");
        for (k, v) in &self.headers {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\n");
        }
        out.extend_from_slice(b"\n");
        match &self.body {
            Some(body) if !body.is_empty() => {
                out.extend_from_slice(b"ContentLength: ");
                out.extend_from_slice(body.len().to_string().as_bytes());
                out.extend_from_slice(b"\n\n");
                out.extend_from_slice(body);
            }
            _ => {
                out.extend_from_slice(b"\n");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_header_wins() {
        let frame = Frame::new(Command::AuthRequire)
            .with_header("AuthToken", "a")
            .with_header("AuthToken", "b");
        assert_eq!(frame.header("AuthToken"), Some("b"));
    }

    #[test]
    fn encode_without_body_has_trailing_blank_line() {
        let frame = Frame::new(Command::ClientReady);
        let mut out = BytesMut::new();
        frame.encode_into(&mut out);
        assert_eq!(out.as_ref(), b"Command: ClientReady\n\n\n");
    }

    #[test]
    fn encode_with_body_declares_content_length() {
        let frame = Frame::new(Command::Forward).with_body(Bytes::from_static(b"ping"));
        let mut out = BytesMut::new();
        frame.encode_into(&mut out);
        assert_eq!(out.as_ref(), b"Command: Forward\n\nContentLength: 4\n\nping");
    }
}
