use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::error::CodecError;
use crate::frame::Frame;

/// One decoded unit. Bodies are streamed chunk-by-chunk rather than
/// buffered whole, so a large `Forward` body never has to be assembled in
/// memory before the first byte can be written onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Command {
        command: Command,
        headers: Vec<(String, String)>,
    },
    Body(Bytes),
}

enum State {
    HeaderParse,
    BodyStream { remaining: usize },
}

/// Decodes/encodes the length-delimited header+body wire framing shared by
/// every link in this crate. One `FrameCodec` per connection; state carries
/// across partial reads the way `tokio_util::codec::Framed` expects.
pub struct FrameCodec {
    state: State,
    command: Option<Command>,
    headers: Vec<(String, String)>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            state: State::HeaderParse,
            command: None,
            headers: Vec::new(),
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.state = State::HeaderParse;
        self.command = None;
        self.headers.clear();
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<FrameEvent>, CodecError> {
        loop {
            let Some(nl) = src.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(nl + 1);
            // drop the trailing '\n' (and a possible '\r' for tolerance)
            let mut line = &line[..line.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.is_empty() {
                // blank line: header block is complete.
                let Some(command) = self.command.take() else {
                    self.reset();
                    return Err(CodecError::MissingCommand);
                };
                let headers = std::mem::take(&mut self.headers);

                let content_length = headers
                    .iter()
                    .rev()
                    .find(|(k, _)| k == "ContentLength")
                    .map(|(_, v)| v.clone());

                match content_length {
                    Some(raw) => {
                        let n: i64 = raw
                            .parse()
                            .map_err(|_| CodecError::InvalidContentLength(raw.clone()))?;
                        if n <= 0 {
                            self.reset();
                            return Err(CodecError::InvalidContentLength(raw));
                        }
                        self.state = State::BodyStream {
                            remaining: n as usize,
                        };
                    }
                    None => {
                        self.reset();
                    }
                }

                return Ok(Some(FrameEvent::Command { command, headers }));
            }

            let text = std::str::from_utf8(line)
                .map_err(|_| CodecError::MalformedHeader(String::from_utf8_lossy(line).into_owned()))?;
            let Some((key, value)) = text.split_once(':') else {
                self.reset();
                return Err(CodecError::MalformedHeader(text.to_string()));
            };
            let key = key.trim();
            let value = value.trim();
            if key == "Command" {
                self.command = Some(key_to_command(value)?);
            } else {
                self.headers.push((key.to_string(), value.to_string()));
            }
        }
    }

    fn decode_body(
        &mut self,
        src: &mut BytesMut,
        remaining: usize,
    ) -> Result<Option<FrameEvent>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        let take = remaining.min(src.len());
        let chunk = src.split_to(take).freeze();
        let left = remaining - take;
        if left == 0 {
            self.reset();
        } else {
            self.state = State::BodyStream { remaining: left };
        }
        Ok(Some(FrameEvent::Body(chunk)))
    }
}

fn key_to_command(value: &str) -> Result<Command, CodecError> {
    value.parse()
}

impl Decoder for FrameCodec {
    type Item = FrameEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            State::HeaderParse => self.decode_header(src),
            State::BodyStream { remaining } => self.decode_body(src, remaining),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode_into(dst);
        Ok(())
    }
}

/// Decode every frame in `data` in one shot, folding `Body` events back onto
/// their preceding `Command` event. Used by tests and by callers that want a
/// fully-buffered `Frame` rather than the streaming `FrameEvent` feed.
#[cfg(test)]
pub fn decode_all(data: &[u8]) -> Result<Vec<Frame>, CodecError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);
    let mut frames = Vec::new();
    let mut current: Option<Frame> = None;
    while let Some(event) = codec.decode(&mut buf)? {
        match event {
            FrameEvent::Command { command, headers } => {
                if let Some(f) = current.take() {
                    frames.push(f);
                }
                current = Some(Frame {
                    command,
                    headers,
                    body: None,
                });
            }
            FrameEvent::Body(chunk) => {
                let f = current.as_mut().expect("Body event without preceding Command");
                let body = f.body.get_or_insert_with(Bytes::new);
                let mut joined = BytesMut::from(body.as_ref());
                joined.extend_from_slice(&chunk);
                *body = joined.freeze();
            }
        }
    }
    if let Some(f) = current.take() {
        frames.push(f);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut out = BytesMut::new();
        frame.encode_into(&mut out);
        out
    }

    #[test]
    fn round_trip_no_body() {
        let frame = Frame::new(Command::AuthSuccess);
        let encoded = encode(&frame);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn round_trip_with_body_and_headers() {
        let frame = Frame::new(Command::Forward)
            .with_header("X", "y")
            .with_body(Bytes::from_static(b"hello world"));
        let encoded = encode(&frame);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn two_frames_split_at_every_index_are_both_emitted() {
        let a = Frame::new(Command::ClientReady);
        let b = Frame::new(Command::Forward)
            .with_header("K", "v")
            .with_body(Bytes::from_static(b"abcxyz"));
        let mut whole = encode(&a);
        whole.extend_from_slice(&encode(&b));
        let whole = whole.freeze();

        for split in 0..=whole.len() {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut current: Option<Frame> = None;
            let mut got = Vec::new();

            let mut feed = |buf: &mut BytesMut, codec: &mut FrameCodec, current: &mut Option<Frame>, got: &mut Vec<Frame>| {
                while let Some(event) = codec.decode(buf).unwrap() {
                    match event {
                        FrameEvent::Command { command, headers } => {
                            if let Some(f) = current.take() {
                                got.push(f);
                            }
                            *current = Some(Frame { command, headers, body: None });
                        }
                        FrameEvent::Body(chunk) => {
                            let f = current.as_mut().unwrap();
                            let mut body = BytesMut::from(f.body.clone().unwrap_or_default().as_ref());
                            body.extend_from_slice(&chunk);
                            f.body = Some(body.freeze());
                        }
                    }
                }
            };

            buf.extend_from_slice(&whole[..split]);
            feed(&mut buf, &mut codec, &mut current, &mut got);
            buf.extend_from_slice(&whole[split..]);
            feed(&mut buf, &mut codec, &mut current, &mut got);
            if let Some(f) = current.take() {
                got.push(f);
            }

            assert_eq!(got, vec![a.clone(), b.clone()], "split at {split}");
        }
    }

    #[test]
    fn missing_command_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"X: y\n\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::MissingCommand)));
    }

    #[test]
    fn non_positive_content_length_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"Command: Forward\nContentLength: 0\n\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn malformed_header_line_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"Command: Forward\nnocolon\n\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::MalformedHeader(_))));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"Command: Bogus\n\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::UnknownCommand(_))));
    }
}
