//! Frame type and incremental codec.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound on a single bulk payload.
///
/// Info snapshots are the largest frames the supervisor ever reads; 16 MiB
/// leaves two orders of magnitude of headroom while bounding a hostile
/// length prefix.
pub const MAX_BULK_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on array arity.
pub const MAX_ARRAY_LEN: usize = 64 * 1024;

/// Decode errors. Incomplete input is not an error (`Ok(None)`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown frame type byte: 0x{0:02x}")]
    UnknownType(u8),

    #[error("invalid length prefix")]
    InvalidLength,

    #[error("bulk length {0} exceeds maximum {MAX_BULK_LEN}")]
    BulkTooLarge(usize),

    #[error("array length {0} exceeds maximum {MAX_ARRAY_LEN}")]
    ArrayTooLarge(usize),

    #[error("invalid integer payload")]
    InvalidInteger,

    #[error("line is not valid utf-8")]
    InvalidUtf8,

    #[error("missing line terminator")]
    BadTerminator,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR ...\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    Bulk(Bytes),
    /// `*2\r\n...`
    Array(Vec<Frame>),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
}

impl Frame {
    /// Builds a bulk frame from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }

    /// Builds the standard command shape: an array of bulk strings.
    pub fn command<I, S>(parts: I) -> Frame
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Frame::Array(
            parts
                .into_iter()
                .map(|p| Frame::Bulk(Bytes::from(p.into())))
                .collect(),
        )
    }

    /// The textual payload of a simple or bulk frame, if it is valid utf-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) | Frame::Error(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The integer payload, also accepting numeric text in bulk frames.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            Frame::Bulk(_) | Frame::Simple(_) => self.as_text()?.parse().ok(),
            _ => None,
        }
    }

    /// The element list of an array frame.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Consumes the frame's bytes on success; consumes nothing on
    /// `Ok(None)` (incomplete) or error.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        let mut pos = 0usize;
        match parse_at(buf, &mut pos)? {
            Some(frame) => {
                buf.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                buf.extend_from_slice(b"+");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                buf.extend_from_slice(b"-");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.extend_from_slice(format!(":{n}\r\n").as_bytes());
            }
            Frame::Bulk(data) => {
                buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Array(items) => {
                buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
            Frame::Null => buf.extend_from_slice(b"$-1\r\n"),
        }
    }
}

/// Finds the CRLF-terminated line starting at `*pos`; advances past it.
fn take_line<'a>(buf: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, WireError> {
    let start = *pos;
    let Some(rel) = buf[start..].iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let end = start + rel;
    if end == start || buf[end - 1] != b'\r' {
        return Err(WireError::BadTerminator);
    }
    *pos = end + 1;
    Ok(Some(&buf[start..end - 1]))
}

fn parse_len(line: &[u8]) -> Result<i64, WireError> {
    std::str::from_utf8(line)
        .map_err(|_| WireError::InvalidLength)?
        .parse::<i64>()
        .map_err(|_| WireError::InvalidLength)
}

fn parse_at(buf: &[u8], pos: &mut usize) -> Result<Option<Frame>, WireError> {
    if *pos >= buf.len() {
        return Ok(None);
    }
    let type_byte = buf[*pos];
    *pos += 1;

    match type_byte {
        b'+' | b'-' => {
            let Some(line) = take_line(buf, pos)? else {
                return Ok(None);
            };
            let text = std::str::from_utf8(line)
                .map_err(|_| WireError::InvalidUtf8)?
                .to_string();
            Ok(Some(if type_byte == b'+' {
                Frame::Simple(text)
            } else {
                Frame::Error(text)
            }))
        }
        b':' => {
            let Some(line) = take_line(buf, pos)? else {
                return Ok(None);
            };
            let n = std::str::from_utf8(line)
                .map_err(|_| WireError::InvalidInteger)?
                .parse::<i64>()
                .map_err(|_| WireError::InvalidInteger)?;
            Ok(Some(Frame::Integer(n)))
        }
        b'$' => {
            let Some(line) = take_line(buf, pos)? else {
                return Ok(None);
            };
            let len = parse_len(line)?;
            if len == -1 {
                return Ok(Some(Frame::Null));
            }
            let len = usize::try_from(len).map_err(|_| WireError::InvalidLength)?;
            if len > MAX_BULK_LEN {
                return Err(WireError::BulkTooLarge(len));
            }
            if buf.len() < *pos + len + 2 {
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&buf[*pos..*pos + len]);
            if &buf[*pos + len..*pos + len + 2] != b"\r\n" {
                return Err(WireError::BadTerminator);
            }
            *pos += len + 2;
            Ok(Some(Frame::Bulk(data)))
        }
        b'*' => {
            let Some(line) = take_line(buf, pos)? else {
                return Ok(None);
            };
            let len = parse_len(line)?;
            if len == -1 {
                return Ok(Some(Frame::Null));
            }
            let len = usize::try_from(len).map_err(|_| WireError::InvalidLength)?;
            if len > MAX_ARRAY_LEN {
                return Err(WireError::ArrayTooLarge(len));
            }
            let mut items = Vec::with_capacity(len.min(64));
            for _ in 0..len {
                match parse_at(buf, pos)? {
                    Some(frame) => items.push(frame),
                    None => return Ok(None),
                }
            }
            Ok(Some(Frame::Array(items)))
        }
        other => Err(WireError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = Frame::decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn decodes_simple_and_error() {
        let frames = decode_all(b"+PONG\r\n-ERR boom\r\n");
        assert_eq!(frames[0], Frame::Simple("PONG".into()));
        assert_eq!(frames[1], Frame::Error("ERR boom".into()));
    }

    #[test]
    fn decodes_bulk_and_null() {
        let frames = decode_all(b"$5\r\nhello\r\n$-1\r\n");
        assert_eq!(frames[0], Frame::bulk(&b"hello"[..]));
        assert_eq!(frames[1], Frame::Null);
    }

    #[test]
    fn decodes_nested_array() {
        let frames = decode_all(b"*3\r\n:1\r\n$1\r\nx\r\n*1\r\n+OK\r\n");
        assert_eq!(
            frames[0],
            Frame::Array(vec![
                Frame::Integer(1),
                Frame::bulk(&b"x"[..]),
                Frame::Array(vec![Frame::Simple("OK".into())]),
            ])
        );
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let mut buf = BytesMut::from(&b"$10\r\nhel"[..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 8);

        buf.extend_from_slice(b"lo-worl");
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"d\r\n");
        assert_eq!(
            Frame::decode(&mut buf).unwrap(),
            Some(Frame::bulk(&b"hello-worl"[..]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let mut buf = BytesMut::from(&b"!oops\r\n"[..]);
        assert_eq!(Frame::decode(&mut buf), Err(WireError::UnknownType(b'!')));
    }

    #[test]
    fn rejects_oversized_bulk_prefix() {
        let mut buf = BytesMut::from(&b"$999999999999\r\n"[..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::BulkTooLarge(_)) | Err(WireError::InvalidLength)
        ));
    }

    #[test]
    fn rejects_bare_lf_terminator() {
        let mut buf = BytesMut::from(&b"+PONG\n"[..]);
        assert_eq!(Frame::decode(&mut buf), Err(WireError::BadTerminator));
    }

    #[test]
    fn integer_helper_reads_bulk_text() {
        assert_eq!(Frame::bulk(&b"42"[..]).as_integer(), Some(42));
        assert_eq!(Frame::Integer(-1).as_integer(), Some(-1));
        assert_eq!(Frame::Null.as_integer(), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_frame() -> impl Strategy<Value = Frame> {
            let leaf = prop_oneof![
                "[a-zA-Z0-9 ]{0,32}".prop_map(Frame::Simple),
                any::<i64>().prop_map(Frame::Integer),
                proptest::collection::vec(any::<u8>(), 0..128)
                    .prop_map(|v| Frame::Bulk(Bytes::from(v))),
                Just(Frame::Null),
            ];
            leaf.prop_recursive(3, 24, 8, |inner| {
                proptest::collection::vec(inner, 0..8).prop_map(Frame::Array)
            })
        }

        proptest! {
            /// Encoding then decoding any frame yields the frame back and
            /// consumes exactly the encoded bytes.
            #[test]
            fn encode_decode_round_trip(frame in arb_frame()) {
                let mut buf = BytesMut::new();
                frame.encode(&mut buf);
                let decoded = Frame::decode(&mut buf).unwrap().unwrap();
                prop_assert_eq!(decoded, frame);
                prop_assert!(buf.is_empty());
            }
        }
    }
}
