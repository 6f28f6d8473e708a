//! Newline framing for the serial link.
//!
//! Inbound bytes are split on `\n` (a trailing `\r` is dropped). Lines that are not
//! valid UTF-8, or that grow past the length bound, are discarded and decoding
//! carries on with the next line. A stock `LinesCodec` would instead fail the
//! stream, and a noisy UART must never end the command channel.
//!
//! Outbound lines have embedded CR/LF replaced with spaces so every encoded frame
//! is exactly one line on the wire.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Lines longer than this are treated as noise.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// How far into the buffer we already looked for a newline.
    next_index: usize,
    /// True while skipping the rest of an overlong line.
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(text) => Some(text.to_string()),
        Err(e) => {
            tracing::debug!(len = raw.len(), error = %e, "Dropping line with invalid UTF-8");
            None
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if self.discarding || src.len() > self.max_length {
                    if !self.discarding {
                        tracing::debug!(len = src.len(), "Discarding overlong line");
                    }
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let frame = src.split_to(end + 1);

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if end > self.max_length {
                tracing::debug!(len = end, "Discarding overlong line");
                continue;
            }
            if let Some(line) = decode_line(&frame[..end]) {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if self.discarding || src.is_empty() {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }

        let rest = src.split();
        Ok(decode_line(&rest))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = line.as_ref();
        dst.reserve(line.len() + 1);
        for (i, part) in line.split(['\r', '\n']).enumerate() {
            if i > 0 {
                dst.put_u8(b' ');
            }
            dst.put_slice(part.as_bytes());
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn splits_on_newline_and_strips_carriage_return() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"CMD:GPIO:ON\r\nCMD:PWM:START\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), ["CMD:GPIO:ON", "CMD:PWM:START"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_line_waits_for_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"CMD:GPIO:BL"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"INK:0.5\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("CMD:GPIO:BLINK:0.5"));
    }

    #[test]
    fn invalid_utf8_line_is_skipped_not_fatal() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\xff\xfe\x00garbage\n");
        buf.extend_from_slice(b"CMD:GPIO:OFF\n");

        assert_eq!(decode_all(&mut codec, &mut buf), ["CMD:GPIO:OFF"]);
    }

    #[test]
    fn overlong_line_is_discarded_across_reads() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"still noise\nCMD:A:B\n");
        assert_eq!(decode_all(&mut codec, &mut buf), ["CMD:A:B"]);
    }

    #[test]
    fn overlong_complete_line_is_discarded() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"way too long\nok\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), ["ok"]);
    }

    #[test]
    fn eof_flushes_unterminated_tail() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"first\nsecond"[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("second"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_keeps_one_frame_per_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("LOG:line one\r\nline two", &mut buf).unwrap();
        codec.encode(String::from("LOG:next"), &mut buf).unwrap();

        insta::assert_snapshot!(
            String::from_utf8(buf.to_vec()).unwrap().trim_end(),
            @r"
        LOG:line one  line two
        LOG:next
        "
        );
    }
}
