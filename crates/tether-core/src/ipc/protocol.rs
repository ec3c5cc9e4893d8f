//! Wire formats for subprocess stdin/stdout.
//!
//! Three framings are supported, each usable for both directions:
//!
//! - `lines`: payload followed by `\n`.
//! - `length_prefixed_uint32_be`: 4-byte big-endian length + payload.
//! - `netstring`: `<decimal length>:<payload>,`.
//!
//! Encoding produces a prolog/epilog pair that surrounds the payload so
//! the payload itself never needs to be copied. Decoding is a split
//! function in the style of a streaming scanner: given the bytes buffered
//! so far, it either yields `(consumed, token)` or asks for more input.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the length prefix used by [`Codec::LengthPrefixedU32Be`].
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default maximum token size, matching common line-scanner defaults.
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

const NEWLINE: &[u8] = b"\n";
const COMMA: &[u8] = b",";

/// Errors produced while decoding a framed stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A netstring began with its length separator.
    #[error("encountered invalid netstring: netstring starts with colon (':')")]
    NetstringStartsWithColon,

    /// A netstring length prefix was not a decimal number.
    #[error("encountered invalid netstring: unable to decode length '{0}'")]
    NetstringInvalidLength(String),

    /// A netstring payload was not followed by `,`.
    #[error("encountered invalid netstring: trailing comma-character is missing")]
    NetstringMissingComma,

    /// A declared frame length cannot be represented on this platform.
    #[error("number of bytes to read ({0}) exceeds representable range")]
    LengthOutOfRange(u64),

    /// A token did not fit into the configured buffer.
    #[error("token too long: exceeds max_buffer of {max} bytes")]
    TokenTooLong { max: usize },

    /// A codec id that is not one of the supported formats.
    #[error(
        "invalid codec '{0}': expected one of ('lines', 'length_prefixed_uint32_be', 'netstring')"
    )]
    UnknownCodec(String),
}

/// Framing used on a subprocess stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// Newline-delimited payloads.
    #[default]
    #[serde(rename = "lines")]
    Lines,
    /// Payloads prefixed with their length as a big-endian `u32`.
    #[serde(rename = "length_prefixed_uint32_be")]
    LengthPrefixedU32Be,
    /// `<len>:<payload>,` netstrings.
    #[serde(rename = "netstring")]
    Netstring,
}

/// Bytes written before and after a payload to frame it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Written before the payload, if any.
    pub prolog: Option<Vec<u8>>,
    /// Written after the payload, if any.
    pub epilog: Option<&'static [u8]>,
}

impl Codec {
    /// All supported codecs.
    pub const ALL: [Codec; 3] = [Codec::Lines, Codec::LengthPrefixedU32Be, Codec::Netstring];

    /// The configuration id of this codec.
    pub fn id(&self) -> &'static str {
        match self {
            Codec::Lines => "lines",
            Codec::LengthPrefixedU32Be => "length_prefixed_uint32_be",
            Codec::Netstring => "netstring",
        }
    }

    /// Build the prolog/epilog that frame a payload of `payload_len` bytes.
    ///
    /// Fails for the length-prefixed codec when the payload is longer than
    /// a `u32` can describe.
    pub fn frame(&self, payload_len: usize) -> Result<Frame, CodecError> {
        let frame = match self {
            Codec::Lines => Frame {
                prolog: None,
                epilog: Some(NEWLINE),
            },
            Codec::LengthPrefixedU32Be => {
                let len = u32::try_from(payload_len)
                    .map_err(|_| CodecError::LengthOutOfRange(payload_len as u64))?;
                Frame {
                    prolog: Some(len.to_be_bytes().to_vec()),
                    epilog: None,
                }
            }
            Codec::Netstring => Frame {
                prolog: Some(format!("{payload_len}:").into_bytes()),
                epilog: Some(COMMA),
            },
        };
        Ok(frame)
    }

    /// Encode a payload into a single contiguous frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let frame = self.frame(payload.len())?;
        let mut out = Vec::with_capacity(
            frame.prolog.as_ref().map_or(0, Vec::len)
                + payload.len()
                + frame.epilog.map_or(0, <[u8]>::len),
        );
        if let Some(prolog) = frame.prolog {
            out.extend_from_slice(&prolog);
        }
        out.extend_from_slice(payload);
        if let Some(epilog) = frame.epilog {
            out.extend_from_slice(epilog);
        }
        Ok(out)
    }

    /// Try to split one token off the front of `data`.
    ///
    /// Returns `Ok(Some((consumed, token)))` when a full frame is buffered,
    /// `Ok(None)` when more input is needed, and an error when the stream
    /// is malformed. `at_eof` signals that no more input will arrive.
    pub fn split<'a>(
        &self,
        data: &'a [u8],
        at_eof: bool,
    ) -> Result<Option<(usize, &'a [u8])>, CodecError> {
        match self {
            Codec::Lines => Ok(split_lines(data, at_eof)),
            Codec::LengthPrefixedU32Be => split_length_prefixed(data, at_eof),
            Codec::Netstring => split_netstring(data, at_eof),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Codec::ALL
            .into_iter()
            .find(|codec| codec.id() == s)
            .ok_or_else(|| CodecError::UnknownCodec(s.to_string()))
    }
}

fn drop_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_lines(data: &[u8], at_eof: bool) -> Option<(usize, &[u8])> {
    if at_eof && data.is_empty() {
        return None;
    }
    if let Some(i) = data.iter().position(|&b| b == b'\n') {
        return Some((i + 1, drop_cr(&data[..i])));
    }
    if at_eof {
        return Some((data.len(), drop_cr(data)));
    }
    None
}

fn split_length_prefixed(
    data: &[u8],
    at_eof: bool,
) -> Result<Option<(usize, &[u8])>, CodecError> {
    if at_eof || data.len() < LENGTH_PREFIX_BYTES {
        return Ok(None);
    }
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    prefix.copy_from_slice(&data[..LENGTH_PREFIX_BYTES]);
    let declared = u32::from_be_bytes(prefix);
    let end = usize::try_from(declared)
        .ok()
        .and_then(|len| len.checked_add(LENGTH_PREFIX_BYTES))
        .filter(|end| *end <= isize::MAX as usize)
        .ok_or(CodecError::LengthOutOfRange(u64::from(declared)))?;

    if data.len() >= end {
        Ok(Some((end, &data[LENGTH_PREFIX_BYTES..end])))
    } else {
        Ok(None)
    }
}

fn split_netstring(
    data: &[u8],
    at_eof: bool,
) -> Result<Option<(usize, &[u8])>, CodecError> {
    if at_eof {
        return Ok(None);
    }
    let Some(colon) = data.iter().position(|&b| b == b':') else {
        return Ok(None);
    };
    if colon == 0 {
        return Err(CodecError::NetstringStartsWithColon);
    }

    let digits = &data[..colon];
    let invalid =
        || CodecError::NetstringInvalidLength(String::from_utf8_lossy(digits).into_owned());
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let declared: u64 = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|len| *len <= i64::MAX as u64)
        .ok_or_else(invalid)?;
    let comma = usize::try_from(declared)
        .ok()
        .and_then(|len| len.checked_add(colon + 1))
        .ok_or(CodecError::LengthOutOfRange(declared))?;

    if data.len() > comma {
        if data[comma] != b',' {
            return Err(CodecError::NetstringMissingComma);
        }
        return Ok(Some((comma + 1, &data[colon + 1..comma])));
    }
    Ok(None)
}

/// Write a framed request to a subprocess and flush it.
///
/// The prolog and epilog are optional so callers can frame a payload
/// without copying it.
pub fn write_frame<W: Write>(
    writer: &mut W,
    prolog: Option<&[u8]>,
    payload: &[u8],
    epilog: Option<&[u8]>,
) -> std::io::Result<()> {
    if let Some(prolog) = prolog {
        writer.write_all(prolog)?;
    }
    writer.write_all(payload)?;
    if let Some(epilog) = epilog {
        writer.write_all(epilog)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: Codec, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut tokens = Vec::new();
        while let Some((consumed, token)) = codec.split(data, false).unwrap() {
            tokens.push(token.to_vec());
            data = &data[consumed..];
        }
        if let Some((_, token)) = codec.split(data, true).unwrap() {
            tokens.push(token.to_vec());
        }
        tokens
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        let payloads: [&[u8]; 4] = [b"hello", b"", b"with spaces, commas: colons", &[0, 1, 2, 255]];
        for codec in Codec::ALL {
            for payload in payloads {
                if codec == Codec::Lines && payload.is_empty() {
                    // An empty line encodes to "\n" which still decodes to one empty token.
                    assert_eq!(decode_all(codec, &codec.encode(payload).unwrap()), vec![Vec::<u8>::new()]);
                    continue;
                }
                let encoded = codec.encode(payload).unwrap();
                assert_eq!(decode_all(codec, &encoded), vec![payload.to_vec()], "{codec}");
            }
        }
    }

    #[test]
    fn test_frame_shapes() {
        assert_eq!(Codec::Lines.encode(b"abc").unwrap(), b"abc\n");
        assert_eq!(Codec::Netstring.encode(b"abc").unwrap(), b"3:abc,");
        assert_eq!(Codec::LengthPrefixedU32Be.encode(b"abc").unwrap(), b"\x00\x00\x00\x03abc");
        assert_eq!(Codec::Netstring.encode(b"").unwrap(), b"0:,");
    }

    #[test]
    fn test_lines_split() {
        assert_eq!(Codec::Lines.split(b"ab\ncd", false).unwrap(), Some((3, &b"ab"[..])));
        assert_eq!(Codec::Lines.split(b"ab\r\n", false).unwrap(), Some((4, &b"ab"[..])));
        assert_eq!(Codec::Lines.split(b"ab", false).unwrap(), None);
        assert_eq!(Codec::Lines.split(b"ab", true).unwrap(), Some((2, &b"ab"[..])));
        assert_eq!(Codec::Lines.split(b"", true).unwrap(), None);
    }

    #[test]
    fn test_length_prefixed_needs_more() {
        let codec = Codec::LengthPrefixedU32Be;
        assert_eq!(codec.split(b"\x00\x00", false).unwrap(), None);
        assert_eq!(codec.split(b"\x00\x00\x00\x05abc", false).unwrap(), None);
        assert_eq!(
            codec.split(b"\x00\x00\x00\x05abcdeXYZ", false).unwrap(),
            Some((9, &b"abcde"[..]))
        );
        assert_eq!(codec.split(b"\x00\x00\x00\x05abcde", true).unwrap(), None);
    }

    #[test]
    fn test_netstring_rejects_leading_colon() {
        assert_eq!(
            Codec::Netstring.split(b":abc,", false),
            Err(CodecError::NetstringStartsWithColon)
        );
    }

    #[test]
    fn test_netstring_rejects_bad_length() {
        let err = Codec::Netstring.split(b"1x:abc,", false).unwrap_err();
        assert_eq!(err, CodecError::NetstringInvalidLength("1x".to_string()));
        assert!(err.to_string().contains("unable to decode length '1x'"));

        assert!(matches!(
            Codec::Netstring.split(b"+3:abc,", false),
            Err(CodecError::NetstringInvalidLength(_))
        ));
    }

    #[test]
    fn test_netstring_rejects_missing_comma() {
        assert_eq!(
            Codec::Netstring.split(b"3:abcd", false),
            Err(CodecError::NetstringMissingComma)
        );
    }

    #[test]
    fn test_netstring_needs_more() {
        assert_eq!(Codec::Netstring.split(b"12", false).unwrap(), None);
        assert_eq!(Codec::Netstring.split(b"3:ab", false).unwrap(), None);
        assert_eq!(Codec::Netstring.split(b"3:abc", false).unwrap(), None);
        assert_eq!(Codec::Netstring.split(b"3:abc,4:", false).unwrap(), Some((6, &b"abc"[..])));
    }

    #[test]
    fn test_codec_ids() {
        for codec in Codec::ALL {
            assert_eq!(codec.id().parse::<Codec>().unwrap(), codec);
        }
        assert_eq!(
            "json".parse::<Codec>(),
            Err(CodecError::UnknownCodec("json".to_string()))
        );
        assert_eq!(Codec::default(), Codec::Lines);
    }

    #[test]
    fn test_codec_serde_ids() {
        let json = serde_json::to_string(&Codec::LengthPrefixedU32Be).unwrap();
        assert_eq!(json, "\"length_prefixed_uint32_be\"");
        let codec: Codec = serde_json::from_str("\"netstring\"").unwrap();
        assert_eq!(codec, Codec::Netstring);
        assert!(serde_json::from_str::<Codec>("\"csv\"").is_err());
    }

    #[test]
    fn test_write_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Some(b"5:"), b"hello", Some(b",")).unwrap();
        assert_eq!(buf, b"5:hello,");

        let mut buf = Vec::new();
        write_frame(&mut buf, None, b"hello", None).unwrap();
        assert_eq!(buf, b"hello");
    }
}
