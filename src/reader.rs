//! Line reader for the pin control protocol.
//!
//! Splits a byte stream on `\n` or `\r`. Runs of terminators never produce
//! empty lines, so `"a\r\n\r\nb\n"` yields exactly `a` then `b`.
//!
//! Reads are batched into a buffer; line splitting behaves as if the stream
//! were consumed one byte at a time. No timeout is applied here: a read
//! blocks for as long as the underlying transport does.
//!
//! A line longer than [`MAX_LINE_LENGTH`] is reported once as
//! [`ReadCause::LineTooLong`] and its bytes are dropped up to the next
//! terminator. The reader stays usable afterwards.
//!
//! Lines are decoded as UTF-8 lossily: invalid sequences become U+FFFD, and
//! that replacement text is what callers see and echo back.

use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest accepted line, excluding the terminator
pub const MAX_LINE_LENGTH: usize = 4096;

/// Read buffer size
const BUFFER_SIZE: usize = 512;

/// Why a line could not be produced. Only [`ReadCause::LineTooLong`] leaves
/// the stream readable.
#[derive(Debug, Error)]
pub enum ReadCause {
    /// Peer closed the stream
    #[error("EOF")]
    Eof,

    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read failure carrying whatever was accumulated before it.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct ReadError {
    /// Unterminated trailing data, possibly empty
    pub partial: String,
    pub cause: ReadCause,
}

impl ReadError {
    /// Whether the stream is finished after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.cause, ReadCause::LineTooLong)
    }
}

/// Yields non-empty lines from a stream.
pub struct LineReader<S> {
    stream: S,
    buffer: BytesMut,
    /// Dropping the tail of an overlong line
    discarding: bool,
}

fn is_terminator(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

impl<S: AsyncRead + Unpin> LineReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            discarding: false,
        }
    }

    /// Access the underlying stream, e.g. to write responses.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read the next non-empty line, without its terminator.
    pub async fn next_line(&mut self) -> Result<String, ReadError> {
        loop {
            if self.discarding {
                match self.buffer.iter().position(|&b| is_terminator(b)) {
                    Some(end) => {
                        self.buffer.advance(end);
                        self.discarding = false;
                    }
                    None => self.buffer.clear(),
                }
            }

            if !self.discarding {
                let skip = self.buffer.iter().take_while(|&&b| is_terminator(b)).count();
                self.buffer.advance(skip);

                match self.buffer.iter().position(|&b| is_terminator(b)) {
                    Some(end) if end <= MAX_LINE_LENGTH => {
                        let line = self.buffer.split_to(end);
                        self.buffer.advance(1);
                        return Ok(String::from_utf8_lossy(&line).into_owned());
                    }
                    Some(end) => {
                        self.buffer.advance(end);
                        return Err(too_long());
                    }
                    None if self.buffer.len() > MAX_LINE_LENGTH => {
                        self.buffer.clear();
                        self.discarding = true;
                        return Err(too_long());
                    }
                    None => {}
                }
            }

            self.buffer.reserve(BUFFER_SIZE);
            match self.stream.read_buf(&mut self.buffer).await {
                Ok(0) => return Err(self.fail(ReadCause::Eof)),
                Ok(_) => {}
                Err(e) => return Err(self.fail(ReadCause::Io(e))),
            }
        }
    }

    fn fail(&mut self, cause: ReadCause) -> ReadError {
        // an overlong tail is never handed out as a partial line
        if self.discarding {
            self.buffer.clear();
        }
        let partial = self.buffer.split();
        ReadError {
            partial: String::from_utf8_lossy(&partial).into_owned(),
            cause,
        }
    }
}

fn too_long() -> ReadError {
    ReadError {
        partial: String::new(),
        cause: ReadCause::LineTooLong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    async fn collect<S: AsyncRead + Unpin>(reader: &mut LineReader<S>) -> (Vec<String>, ReadError) {
        let mut lines = Vec::new();
        loop {
            match reader.next_line().await {
                Ok(line) => lines.push(line),
                Err(e) => return (lines, e),
            }
        }
    }

    #[tokio::test]
    async fn test_consecutive_terminators() {
        let mut reader = LineReader::new(Builder::new().read(b"a\n\n\nb\n").build());
        let (lines, err) = collect(&mut reader).await;

        assert_eq!(lines, vec!["a", "b"]);
        assert!(matches!(err.cause, ReadCause::Eof));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_terminators() {
        let mut reader = LineReader::new(Builder::new().read(b"\r\n\r\nread 4\r\nclose\r").build());
        let (lines, _) = collect(&mut reader).await;

        assert_eq!(lines, vec!["read 4", "close"]);
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let mock = Builder::new()
            .read(b"out")
            .read(b"put 4")
            .read(b"\nhi")
            .read(b"gh 4\n")
            .build();
        let mut reader = LineReader::new(mock);
        let (lines, _) = collect(&mut reader).await;

        assert_eq!(lines, vec!["output 4", "high 4"]);
    }

    #[tokio::test]
    async fn test_partial_line_on_eof() {
        let mut reader = LineReader::new(Builder::new().read(b"read 4\nhig").build());

        assert_eq!(reader.next_line().await.unwrap(), "read 4");

        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.partial, "hig");
        assert_eq!(err.to_string(), "EOF");
    }

    #[tokio::test]
    async fn test_partial_line_on_error() {
        let mock = Builder::new()
            .read(b"tog")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = LineReader::new(mock);

        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.partial, "tog");
        assert!(matches!(err.cause, ReadCause::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_only_terminators() {
        let mut reader = LineReader::new(Builder::new().read(b"\n\r\n\r").build());

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err.cause, ReadCause::Eof));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let long = vec![b'x'; MAX_LINE_LENGTH + 1];
        let mut reader = LineReader::new(Builder::new().read(&long).build());

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err.cause, ReadCause::LineTooLong));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped() {
        let mut data = vec![b'x'; 5000];
        data.extend_from_slice(b" 4\nread 4\n");
        let mut reader = LineReader::new(Builder::new().read(&data).build());

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err.cause, ReadCause::LineTooLong));
        assert_eq!(reader.next_line().await.unwrap(), "read 4");

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err.cause, ReadCause::Eof));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn test_overlong_line_split_across_reads() {
        let chunk = vec![b'y'; 3000];
        let mock = Builder::new()
            .read(&chunk)
            .read(&chunk)
            .read(&chunk)
            .read(b"yy\rclose\n")
            .build();
        let mut reader = LineReader::new(mock);

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err.cause, ReadCause::LineTooLong));
        assert_eq!(reader.next_line().await.unwrap(), "close");
    }

    #[tokio::test]
    async fn test_overlong_tail_not_reported_on_eof() {
        let long = vec![b'z'; MAX_LINE_LENGTH + 100];
        let mut reader = LineReader::new(Builder::new().read(&long).read(b"zzz").build());

        assert!(!reader.next_line().await.unwrap_err().is_fatal());

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err.cause, ReadCause::Eof));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let mut reader = LineReader::new(Builder::new().read(b"\xffbad 1\n").build());

        assert_eq!(reader.next_line().await.unwrap(), "\u{FFFD}bad 1");
    }

    #[tokio::test]
    async fn test_max_length_line_accepted() {
        let mut data = vec![b'x'; MAX_LINE_LENGTH];
        data.push(b'\n');
        let mut reader = LineReader::new(Builder::new().read(&data).build());

        assert_eq!(reader.next_line().await.unwrap().len(), MAX_LINE_LENGTH);
    }
}
