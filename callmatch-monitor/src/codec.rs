//! Newline framing for the call monitor byte stream.
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::error::CodecError;

/// Splits the call monitor stream into trimmed, non-empty lines.
///
/// Bytes that are not valid UTF-8 are replaced rather than failing the connection. A line that
/// grows past `max_length` bytes is a protocol error.
pub struct CallMonitorCodec {
    max_length: usize,
    /// Index up to which the buffer is known to hold no newline.
    next_index: usize,
}

impl CallMonitorCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Decoder for CallMonitorCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if buf.len() > self.max_length {
                    return Err(CodecError::LineTooLong {
                        max_length: self.max_length,
                    });
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            if end > self.max_length {
                return Err(CodecError::LineTooLong {
                    max_length: self.max_length,
                });
            }

            let frame = buf.split_to(end + 1);
            let line = String::from_utf8_lossy(&frame[..end]);
            let line = line.trim();

            if !line.is_empty() {
                return Ok(Some(line.to_owned()));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        if !buf.is_empty() {
            debug!("discarding {} bytes of an incomplete line", buf.len());
            buf.clear();
        }
        self.next_index = 0;

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut CallMonitorCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).expect("decode failed") {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_splits_lines_across_chunks() {
        let mut codec = CallMonitorCodec::new(4096);
        let mut buf = BytesMut::from("01.01.25 10:30:00;RING;0;0151");

        assert!(decode_all(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"234567890;200893;SIP0;\r\n01.01.25 10:30:05;CONNECT;0;");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["01.01.25 10:30:00;RING;0;0151234567890;200893;SIP0;".to_owned()]
        );

        buf.extend_from_slice(b"4;0151234567890;\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["01.01.25 10:30:05;CONNECT;0;4;0151234567890;".to_owned()]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_skips_blank_lines() {
        let mut codec = CallMonitorCodec::new(4096);
        let mut buf = BytesMut::from("\n\r\n  \nA;RING\n");

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["A;RING".to_owned()]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = CallMonitorCodec::new(4096);
        let mut buf = BytesMut::from(&b"x;RING;\xff;1;2;3;\n"[..]);

        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["x;RING;\u{fffd};1;2;3;".to_owned()]
        );
    }

    #[test]
    fn test_rejects_overlong_line() {
        let mut codec = CallMonitorCodec::new(8);
        let mut buf = BytesMut::from("0123456789");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong { max_length: 8 })
        ));
    }

    #[test]
    fn test_eof_discards_incomplete_line() {
        let mut codec = CallMonitorCodec::new(4096);
        let mut buf = BytesMut::from("a;b\nc;d");

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("a;b".to_owned()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }
}
