//! Message framing over a channel's byte stream.
//!
//! Three framings are supported:
//!
//! ```text
//! Raw:            whatever a single read returned
//! Line:           PING\r\n
//! LengthPrefixed: 4\r\nPING
//! ```
//!
//! Raw framing reproduces the behaviour of a plain fixed-buffer read and is
//! only safe when messages are small and never coalesced by the peer.

use bytes::BytesMut;
use serde::Deserialize;

/// Longest decimal length header accepted by `LengthPrefixed`.
const MAX_LENGTH_DIGITS: usize = 20;

/// How messages are delimited on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Each read is one message.
    Raw,
    /// Messages are terminated by `\r\n`.
    #[default]
    Line,
    /// `<length>\r\n<data of exactly length bytes>`.
    #[serde(rename = "length")]
    #[value(name = "length")]
    LengthPrefixed,
}

/// Result of decoding the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A full message and the number of input bytes it occupied.
    Complete { message: &'a [u8], consumed: usize },
    /// Need more data.
    Incomplete,
}

/// Framing failures. Any of these closes the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame cannot fit in the channel buffer.
    TooLarge { needed: usize, limit: usize },
    /// The length header is not a decimal number.
    InvalidLength,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge { needed, limit } => {
                write!(f, "frame of {needed} bytes exceeds buffer limit {limit}")
            }
            FrameError::InvalidLength => write!(f, "invalid length header"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Framing {
    /// Decode one message from the front of `input`.
    ///
    /// `limit` is the capacity of the receiving buffer: a frame that could
    /// never fit is reported as `TooLarge` instead of `Incomplete`.
    pub fn decode<'a>(&self, input: &'a [u8], limit: usize) -> Result<Decoded<'a>, FrameError> {
        match self {
            Framing::Raw => {
                if input.is_empty() {
                    Ok(Decoded::Incomplete)
                } else {
                    Ok(Decoded::Complete {
                        message: input,
                        consumed: input.len(),
                    })
                }
            }
            Framing::Line => match find_crlf(input) {
                Some(pos) => Ok(Decoded::Complete {
                    message: &input[..pos],
                    consumed: pos + 2,
                }),
                None if input.len() >= limit => Err(FrameError::TooLarge {
                    needed: input.len() + 1,
                    limit,
                }),
                None => Ok(Decoded::Incomplete),
            },
            Framing::LengthPrefixed => {
                let header_end = match find_crlf(input) {
                    Some(pos) => pos,
                    None if input.len() > MAX_LENGTH_DIGITS => {
                        return Err(FrameError::InvalidLength)
                    }
                    None => return Ok(Decoded::Incomplete),
                };
                let length = std::str::from_utf8(&input[..header_end])
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or(FrameError::InvalidLength)?;

                let start = header_end + 2;
                let needed = start.saturating_add(length);
                if needed > limit {
                    return Err(FrameError::TooLarge { needed, limit });
                }
                if input.len() < needed {
                    return Ok(Decoded::Incomplete);
                }
                Ok(Decoded::Complete {
                    message: &input[start..needed],
                    consumed: needed,
                })
            }
        }
    }

    /// Append `message` to `output` in this framing.
    pub fn encode(&self, message: &[u8], output: &mut BytesMut) {
        match self {
            Framing::Raw => output.extend_from_slice(message),
            Framing::Line => {
                output.reserve(message.len() + 2);
                output.extend_from_slice(message);
                output.extend_from_slice(b"\r\n");
            }
            Framing::LengthPrefixed => {
                let header = format!("{}\r\n", message.len());
                output.reserve(header.len() + message.len());
                output.extend_from_slice(header.as_bytes());
                output.extend_from_slice(message);
            }
        }
    }
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_decode() {
        let framing = Framing::Line;
        assert_eq!(
            framing.decode(b"PING\r\nPI", 1024),
            Ok(Decoded::Complete {
                message: b"PING",
                consumed: 6
            })
        );
        assert_eq!(framing.decode(b"PING", 1024), Ok(Decoded::Incomplete));
    }

    #[test]
    fn test_line_too_large() {
        let input = [b'x'; 8];
        assert!(matches!(
            Framing::Line.decode(&input, 8),
            Err(FrameError::TooLarge { limit: 8, .. })
        ));
    }

    #[test]
    fn test_length_prefixed_decode() {
        let framing = Framing::LengthPrefixed;
        assert_eq!(framing.decode(b"5\r\nhel", 1024), Ok(Decoded::Incomplete));
        assert_eq!(
            framing.decode(b"5\r\nhello5\r\n", 1024),
            Ok(Decoded::Complete {
                message: b"hello",
                consumed: 8
            })
        );
        assert_eq!(
            framing.decode(b"0\r\n", 1024),
            Ok(Decoded::Complete {
                message: b"",
                consumed: 3
            })
        );
    }

    #[test]
    fn test_length_prefixed_errors() {
        let framing = Framing::LengthPrefixed;
        assert_eq!(
            framing.decode(b"abc\r\n", 1024),
            Err(FrameError::InvalidLength)
        );
        assert_eq!(
            framing.decode(b"100\r\n", 16),
            Err(FrameError::TooLarge {
                needed: 105,
                limit: 16
            })
        );
        assert_eq!(
            framing.decode(&[b'9'; 32], 1024),
            Err(FrameError::InvalidLength)
        );
    }

    #[test]
    fn test_raw_keeps_bytes_untouched() {
        // No trimming of padding or whitespace.
        assert_eq!(
            Framing::Raw.decode(b"PONG \0", 1024),
            Ok(Decoded::Complete {
                message: b"PONG \0",
                consumed: 6
            })
        );
        assert_eq!(Framing::Raw.decode(b"", 1024), Ok(Decoded::Incomplete));
    }

    #[test]
    fn test_encode() {
        let mut out = BytesMut::new();
        Framing::Line.encode(b"PING", &mut out);
        Framing::LengthPrefixed.encode(b"PONG", &mut out);
        Framing::Raw.encode(b"!", &mut out);
        assert_eq!(&out[..], b"PING\r\n4\r\nPONG!");
    }
}
