//! Streaming frame reader for subprocess output.

use std::io::{ErrorKind, Read};

use crate::error::{Error, Result};

use super::protocol::{Codec, CodecError};

/// Initial read buffer size; grows up to the configured maximum.
const INITIAL_BUFFER: usize = 4096;

/// Splits a byte stream into tokens according to a [`Codec`].
///
/// The reader buffers at most `max_buffer` bytes. A frame that does not fit
/// fails with [`CodecError::TokenTooLong`]. After the first error or the end
/// of the stream the iterator is exhausted.
pub struct FrameReader<R> {
    reader: R,
    codec: Codec,
    max_buffer: usize,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader splitting `reader` with `codec`.
    pub fn new(reader: R, codec: Codec, max_buffer: usize) -> Self {
        Self {
            reader,
            codec,
            max_buffer: max_buffer.max(1),
            buf: Vec::new(),
            start: 0,
            end: 0,
            eof: false,
            done: false,
        }
    }

    fn fail(&mut self, err: Error) -> Option<Result<Vec<u8>>> {
        self.done = true;
        Some(Err(err))
    }

    /// Read the next token, or `None` at the end of the stream.
    pub fn next_token(&mut self) -> Option<Result<Vec<u8>>> {
        if self.done {
            return None;
        }
        loop {
            if self.end > self.start || self.eof {
                match self.codec.split(&self.buf[self.start..self.end], self.eof) {
                    Ok(Some((consumed, token))) => {
                        let token = token.to_vec();
                        self.start += consumed;
                        return Some(Ok(token));
                    }
                    Ok(None) => {}
                    Err(e) => return self.fail(e.into()),
                }
            }
            if self.eof {
                self.done = true;
                return None;
            }

            // Shift unconsumed bytes to the front before reading more.
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            if self.end == self.buf.len() {
                if self.buf.len() >= self.max_buffer {
                    return self.fail(
                        CodecError::TokenTooLong {
                            max: self.max_buffer,
                        }
                        .into(),
                    );
                }
                let grown = (self.buf.len() * 2)
                    .max(INITIAL_BUFFER)
                    .min(self.max_buffer);
                self.buf.resize(grown, 0);
            }

            match self.reader.read(&mut self.buf[self.end..]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.end += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return self.fail(e.into()),
            }
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out one byte per call to exercise partial frames.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.split_first() {
                Some((&b, rest)) if !buf.is_empty() => {
                    buf[0] = b;
                    self.0 = rest;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn test_reads_lines() {
        let reader = FrameReader::new(Cursor::new(b"one\ntwo\nthree".to_vec()), Codec::Lines, 1024);
        let tokens: Vec<_> = reader.map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_reads_partial_netstrings() {
        let data = b"5:hello,5:world,";
        let reader = FrameReader::new(Trickle(data), Codec::Netstring, 1024);
        let tokens: Vec<_> = reader.map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn test_reads_partial_length_prefixed() {
        let mut data = Codec::LengthPrefixedU32Be.encode(b"abc").unwrap();
        data.extend(Codec::LengthPrefixedU32Be.encode(b"").unwrap());
        data.extend(Codec::LengthPrefixedU32Be.encode(b"defg").unwrap());
        let reader = FrameReader::new(Trickle(&data), Codec::LengthPrefixedU32Be, 1024);
        let tokens: Vec<_> = reader.map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec![b"abc".to_vec(), Vec::new(), b"defg".to_vec()]);
    }

    #[test]
    fn test_truncated_frame_is_dropped_at_eof() {
        let reader = FrameReader::new(Cursor::new(b"5:hel".to_vec()), Codec::Netstring, 1024);
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn test_token_too_long() {
        let mut reader = FrameReader::new(Cursor::new(vec![b'x'; 64]), Codec::Lines, 16);
        match reader.next() {
            Some(Err(Error::Codec(CodecError::TokenTooLong { max: 16 }))) => {}
            other => panic!("expected TokenTooLong, got {:?}", other),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_buffer_grows_for_large_tokens() {
        let mut data = vec![b'y'; 10_000];
        data.push(b'\n');
        let mut reader = FrameReader::new(Cursor::new(data), Codec::Lines, 16 * 1024);
        assert_eq!(reader.next().unwrap().unwrap().len(), 10_000);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_malformed_frame_stops_reader() {
        let mut reader = FrameReader::new(Cursor::new(b":oops,3:abc,".to_vec()), Codec::Netstring, 1024);
        assert!(matches!(
            reader.next(),
            Some(Err(Error::Codec(CodecError::NetstringStartsWithColon)))
        ));
        assert!(reader.next().is_none());
    }
}
