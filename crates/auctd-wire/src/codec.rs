//! Blank-line-delimited frame codec.
//!
//! Splits the byte stream on the first empty line (either `\n\n` or
//! `\r\n\r\n`), hands the frame to `Message::parse`, and enforces a
//! maximum frame size so a misbehaving peer cannot grow the read buffer
//! without bound.

use crate::error::WireError;
use crate::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame size in bytes.
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024;

/// Codec for blank-line-terminated header/value messages.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_frame: usize,
}

impl LineCodec {
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Find the end of the first complete frame: the index one past the
    /// blank line, or None if the frame is still incomplete.
    fn frame_end(buf: &BytesMut) -> Option<usize> {
        let mut prev_newline = None;
        for (i, &b) in buf.iter().enumerate() {
            if b != b'\n' {
                continue;
            }
            if let Some(p) = prev_newline {
                // Two newlines with nothing but an optional '\r' between
                // them terminate the frame.
                let gap = &buf[p + 1..i];
                if gap.is_empty() || gap == b"\r" {
                    return Some(i + 1);
                }
            }
            prev_newline = Some(i);
        }
        None
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        // Skip leading blank lines between frames.
        while src.first() == Some(&b'\n') {
            src.advance(1);
        }

        match Self::frame_end(src) {
            Some(end) => {
                let frame = src.split_to(end);
                let text = std::str::from_utf8(&frame)?;
                Message::parse(text).map(Some)
            }
            None => {
                if src.len() > self.max_frame {
                    return Err(WireError::FrameTooLarge {
                        max: self.max_frame,
                    });
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        let encoded = msg.encode();
        dst.reserve(encoded.len());
        dst.put_slice(encoded.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Status, Verb};

    fn decode_all(codec: &mut LineCodec, bytes: &[u8]) -> Vec<Message> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(&mut buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_decode_single_frame() {
        let mut codec = LineCodec::default();
        let msgs = decode_all(&mut codec, b"REGISTER\nType: buyer\nId: t1\n\n");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].verb, Verb::Register);
        assert_eq!(msgs[0].id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut codec = LineCodec::default();
        let msgs = decode_all(&mut codec, b"OK\nId: 1\n\nOK\nId: 2\n\n");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].numeric_id(), Some(1));
        assert_eq!(msgs[1].numeric_id(), Some(2));
    }

    #[test]
    fn test_decode_incomplete_frame_waits() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"ORDER\nType: ask\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"Id: 3\n\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.verb, Verb::Order);
        assert_eq!(msg.numeric_id(), Some(3));
    }

    #[test]
    fn test_decode_crlf_frames() {
        let mut codec = LineCodec::default();
        let msgs = decode_all(&mut codec, b"OK\r\nId: 4\r\n\r\n");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].numeric_id(), Some(4));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = LineCodec::new(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"POST\nValue: ");
        buf.extend_from_slice(&vec![b'x'; 64]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = LineCodec::default();
        let msg = Message::new(Verb::Order).with_type("bid").with_id("11");
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);

        let response = Message::response(Status::Invalid, &decoded);
        codec.encode(response, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.verb, Verb::Invalid);
        assert_eq!(decoded.numeric_id(), Some(11));
    }
}
