/*!
 * Stream framing.
 *
 * TCP and TLS are stream substrates without message boundaries. The
 * tokenizer accumulates inbound bytes and splits them into discrete
 * messages according to the driver's framing rule. Partial messages
 * persist across calls; splitting the same byte stream into different
 * chunkings always yields the same message sequence.
 */
use std::fmt;

use crate::error::{Error, Result};

/// Default ceiling on a single framed message (anti-OOM protection)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Byte order of a length-prefix field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Network byte order
    Big,
    /// Little-endian
    Little,
}

/// The framing rule applied to the inbound byte stream
pub enum Framing {
    /// Each message ends with (and includes) this byte sequence
    Delimiter(Vec<u8>),
    /// Every message is exactly this many bytes
    FixedLength(usize),
    /// Messages carry their own length in a header field
    LengthPrefix {
        /// Bytes before the length field
        header_offset: usize,
        /// Width of the length field in bytes (1, 2, 4, or 8)
        width: usize,
        /// Byte order of the length field
        endian: Endian,
        /// Whether the decoded length counts the header and length field
        includes_header: bool,
    },
    /// A caller-supplied rule: bytes in the next message, or 0 if the
    /// buffer does not yet hold a complete one
    Custom(Box<dyn FnMut(&[u8]) -> usize + Send>),
}

impl fmt::Debug for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Delimiter(d) => f.debug_tuple("Delimiter").field(d).finish(),
            Framing::FixedLength(n) => f.debug_tuple("FixedLength").field(n).finish(),
            Framing::LengthPrefix {
                header_offset,
                width,
                endian,
                includes_header,
            } => f
                .debug_struct("LengthPrefix")
                .field("header_offset", header_offset)
                .field("width", width)
                .field("endian", endian)
                .field("includes_header", includes_header)
                .finish(),
            Framing::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Splits an append-only byte stream into discrete messages
#[derive(Debug)]
pub struct Tokenizer {
    framing: Framing,
    buffer: Vec<u8>,
    max_size: usize,
}

impl Tokenizer {
    /// Create a tokenizer with the default message ceiling
    pub fn new(framing: Framing) -> Self {
        Self::with_max_size(framing, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a tokenizer with an explicit message ceiling
    pub fn with_max_size(framing: Framing, max_size: usize) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            max_size,
        }
    }

    /// Append `data` and drain every complete message, in arrival order.
    ///
    /// The unframed tail stays buffered for the next call. A message
    /// larger than the ceiling clears the buffer and returns an error;
    /// the caller logs it and keeps reading.
    pub fn extract(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            let len = match self.next_message_len() {
                Ok(len) => len,
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            };
            if len == 0 || len > self.buffer.len() {
                break;
            }
            messages.push(self.buffer.drain(..len).collect());
        }

        // Guard against unbounded growth while no boundary is found
        if self.buffer.len() > self.max_size {
            let buffered = self.buffer.len();
            self.buffer.clear();
            return Err(Error::frame_overflow(format!(
                "{} bytes buffered without a message boundary (ceiling {})",
                buffered, self.max_size
            )));
        }

        Ok(messages)
    }

    /// Discard any buffered partial message
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// The unframed tail currently buffered
    pub fn residual(&self) -> &[u8] {
        &self.buffer
    }

    /// Length of the next complete message, or 0 if more bytes are needed
    fn next_message_len(&mut self) -> Result<usize> {
        match &mut self.framing {
            Framing::Delimiter(delimiter) => {
                if delimiter.is_empty() || self.buffer.len() < delimiter.len() {
                    return Ok(0);
                }
                Ok(self
                    .buffer
                    .windows(delimiter.len())
                    .position(|window| window == delimiter.as_slice())
                    .map(|pos| pos + delimiter.len())
                    .unwrap_or(0))
            }
            Framing::FixedLength(size) => {
                if *size == 0 || self.buffer.len() < *size {
                    Ok(0)
                } else {
                    Ok(*size)
                }
            }
            Framing::LengthPrefix {
                header_offset,
                width,
                endian,
                includes_header,
            } => {
                let header_len = *header_offset + *width;
                if self.buffer.len() < header_len {
                    return Ok(0);
                }
                let field = &self.buffer[*header_offset..header_len];
                let decoded = decode_length(field, *endian);
                let total = if *includes_header {
                    decoded
                } else {
                    decoded.saturating_add(header_len as u64)
                };
                if total > self.max_size as u64 {
                    return Err(Error::frame_overflow(format!(
                        "message of {} bytes exceeds ceiling of {}",
                        total, self.max_size
                    )));
                }
                let total = total as usize;
                if *includes_header && total < header_len {
                    return Err(Error::frame_overflow(format!(
                        "declared length {} is shorter than its own header",
                        total
                    )));
                }
                Ok(total)
            }
            Framing::Custom(rule) => {
                let len = rule(&self.buffer);
                if len > self.max_size {
                    return Err(Error::frame_overflow(format!(
                        "message of {} bytes exceeds ceiling of {}",
                        len, self.max_size
                    )));
                }
                Ok(len)
            }
        }
    }
}

fn decode_length(field: &[u8], endian: Endian) -> u64 {
    let mut value: u64 = 0;
    match endian {
        Endian::Big => {
            for byte in field {
                value = (value << 8) | u64::from(*byte);
            }
        }
        Endian::Little => {
            for byte in field.iter().rev() {
                value = (value << 8) | u64::from(*byte);
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delimited(delim: &[u8]) -> Tokenizer {
        Tokenizer::new(Framing::Delimiter(delim.to_vec()))
    }

    #[test]
    fn test_delimiter_framing() {
        let mut tok = delimited(b"\n");

        assert!(tok.extract(b"ab").unwrap().is_empty());
        let messages = tok.extract(b"c\nde\nf").unwrap();
        assert_eq!(messages, vec![b"abc\n".to_vec(), b"de\n".to_vec()]);
        assert_eq!(tok.residual(), b"f");
    }

    #[test]
    fn test_multi_byte_delimiter() {
        let mut tok = delimited(b"\r\n");
        let messages = tok.extract(b"one\r\ntwo\r").unwrap();
        assert_eq!(messages, vec![b"one\r\n".to_vec()]);
        // Delimiter split across calls
        let messages = tok.extract(b"\nthree").unwrap();
        assert_eq!(messages, vec![b"two\r\n".to_vec()]);
        assert_eq!(tok.residual(), b"three");
    }

    #[test]
    fn test_fixed_length_framing() {
        let mut tok = Tokenizer::new(Framing::FixedLength(4));
        let messages = tok.extract(b"abcdefghij").unwrap();
        assert_eq!(messages, vec![b"abcd".to_vec(), b"efgh".to_vec()]);
        assert_eq!(tok.residual(), b"ij");
    }

    #[test]
    fn test_length_prefix_big_endian() {
        let mut tok = Tokenizer::new(Framing::LengthPrefix {
            header_offset: 0,
            width: 2,
            endian: Endian::Big,
            includes_header: false,
        });

        // Length 3, payload "abc", then a partial second message
        let messages = tok.extract(b"\x00\x03abc\x00\x05he").unwrap();
        assert_eq!(messages, vec![b"\x00\x03abc".to_vec()]);
        let messages = tok.extract(b"llo").unwrap();
        assert_eq!(messages, vec![b"\x00\x05hello".to_vec()]);
        assert!(tok.residual().is_empty());
    }

    #[test]
    fn test_length_prefix_little_endian_with_offset() {
        let mut tok = Tokenizer::new(Framing::LengthPrefix {
            header_offset: 2,
            width: 2,
            endian: Endian::Little,
            includes_header: false,
        });

        // 2 magic bytes, little-endian length 4, 4 payload bytes
        let messages = tok.extract(b"MK\x04\x00wxyz").unwrap();
        assert_eq!(messages, vec![b"MK\x04\x00wxyz".to_vec()]);
    }

    #[test]
    fn test_length_prefix_includes_header() {
        let mut tok = Tokenizer::new(Framing::LengthPrefix {
            header_offset: 0,
            width: 1,
            endian: Endian::Big,
            includes_header: true,
        });

        // Declared length covers the length byte itself
        let messages = tok.extract(b"\x04abc\x02x").unwrap();
        assert_eq!(messages, vec![b"\x04abc".to_vec(), b"\x02x".to_vec()]);
    }

    #[test]
    fn test_length_prefix_overflow_clears_buffer() {
        let mut tok = Tokenizer::with_max_size(
            Framing::LengthPrefix {
                header_offset: 0,
                width: 4,
                endian: Endian::Big,
                includes_header: false,
            },
            64,
        );

        let result = tok.extract(b"\xff\xff\xff\xff");
        assert!(matches!(result, Err(Error::FrameOverflow(_))));
        assert!(tok.residual().is_empty());

        // The tokenizer keeps working after the error
        let mut tok2 = Tokenizer::new(Framing::Delimiter(b"\n".to_vec()));
        assert!(tok2.extract(b"ok\n").unwrap().len() == 1);
    }

    #[test]
    fn test_custom_rule() {
        // Messages are "<len as ascii digit><payload>"
        let mut tok = Tokenizer::new(Framing::Custom(Box::new(|buf: &[u8]| {
            let Some(first) = buf.first() else { return 0 };
            let len = (*first - b'0') as usize + 1;
            if buf.len() >= len {
                len
            } else {
                0
            }
        })));

        let messages = tok.extract(b"3abc2de1").unwrap();
        assert_eq!(messages, vec![b"3abc".to_vec(), b"2de".to_vec()]);
        assert_eq!(tok.residual(), b"1");
    }

    #[test]
    fn test_unbounded_growth_without_delimiter() {
        let mut tok = Tokenizer::with_max_size(Framing::Delimiter(b"\n".to_vec()), 8);
        let result = tok.extract(b"0123456789");
        assert!(matches!(result, Err(Error::FrameOverflow(_))));
        assert!(tok.residual().is_empty());
    }

    #[test]
    fn test_clear_discards_tail() {
        let mut tok = delimited(b"\n");
        tok.extract(b"partial").unwrap();
        assert_eq!(tok.residual(), b"partial");
        tok.clear();
        assert!(tok.residual().is_empty());

        let messages = tok.extract(b"fresh\n").unwrap();
        assert_eq!(messages, vec![b"fresh\n".to_vec()]);
    }

    #[test]
    fn test_chunking_invariance() {
        let stream = b"alpha\nbeta\ngamma\ndelta";
        let expected = vec![b"alpha\n".to_vec(), b"beta\n".to_vec(), b"gamma\n".to_vec()];

        for split in [1, 2, 3, 5, 7, stream.len()] {
            let mut tok = delimited(b"\n");
            let mut messages = Vec::new();
            for chunk in stream.chunks(split) {
                messages.extend(tok.extract(chunk).unwrap());
            }
            assert_eq!(messages, expected, "chunk size {}", split);
            assert_eq!(tok.residual(), b"delta");
        }
    }
}
