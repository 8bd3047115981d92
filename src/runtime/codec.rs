//! Byte-level helpers shared by the event loop.
//!
//! There is no framing: whatever a drain of the socket yields is treated as a
//! single message. A message split across segments may therefore be handled
//! as several messages, and back-to-back messages may be coalesced.

use bytes::BytesMut;
use std::io::{self, Read, Write};

/// Size of each individual `read` call while draining a socket.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Most bytes taken from a socket per readable event. Anything beyond this
/// stays in the kernel and is picked up after the response is written.
pub const MAX_MESSAGE_SIZE: usize = 4 * READ_CHUNK_SIZE;

/// Result of draining a non-blocking reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended to the buffer. `eof` is set if the peer also
    /// closed its side after sending them.
    Data { len: usize, eof: bool },
    /// Peer closed and nothing was pending.
    Closed,
    /// Nothing available yet (spurious wakeup).
    Empty,
}

/// Read from `reader` into `buf` until it would block, reports EOF, or
/// `limit` bytes have been read.
pub fn read_available<R: Read>(
    reader: &mut R,
    buf: &mut BytesMut,
    limit: usize,
) -> io::Result<ReadOutcome> {
    let start = buf.len();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut eof = false;

    loop {
        let remaining = limit - (buf.len() - start);
        if remaining == 0 {
            break;
        }

        let want = remaining.min(READ_CHUNK_SIZE);
        match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = buf.len() - start;
    Ok(match (len, eof) {
        (0, true) => ReadOutcome::Closed,
        (0, false) => ReadOutcome::Empty,
        (len, eof) => ReadOutcome::Data { len, eof },
    })
}

/// Decode received bytes as UTF-8, substituting U+FFFD for invalid sequences.
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Build the response for one received message.
pub fn format_response(prefix: &str, content: &str) -> String {
    let mut response = String::with_capacity(prefix.len() + content.len());
    response.push_str(prefix);
    response.push_str(content);
    response
}

/// Write a response string in full.
pub fn write_response<W: Write>(writer: &mut W, response: &str) -> io::Result<()> {
    writer.write_all(response.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that replays scripted results, then reports `WouldBlock`.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
            }
        }
    }

    fn scripted(steps: Vec<io::Result<Vec<u8>>>) -> Scripted {
        Scripted(steps.into())
    }

    #[test]
    fn test_drains_until_would_block() {
        let mut reader = scripted(vec![Ok(b"hel".to_vec()), Ok(b"lo".to_vec())]);
        let mut buf = BytesMut::new();

        let outcome = read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(outcome, ReadOutcome::Data { len: 5, eof: false });
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_eof_without_data_is_closed() {
        let mut reader = scripted(vec![Ok(Vec::new())]);
        let mut buf = BytesMut::new();
        assert_eq!(
            read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap(),
            ReadOutcome::Closed
        );
    }

    #[test]
    fn test_data_then_eof() {
        let mut reader = scripted(vec![Ok(b"bye".to_vec()), Ok(Vec::new())]);
        let mut buf = BytesMut::new();
        assert_eq!(
            read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap(),
            ReadOutcome::Data { len: 3, eof: true }
        );
    }

    #[test]
    fn test_spurious_wakeup_is_empty() {
        let mut reader = scripted(Vec::new());
        let mut buf = BytesMut::new();
        assert_eq!(
            read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap(),
            ReadOutcome::Empty
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_interrupted_is_retried() {
        let mut reader = scripted(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Ok(b"x".to_vec()),
        ]);
        let mut buf = BytesMut::new();
        assert_eq!(
            read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap(),
            ReadOutcome::Data { len: 1, eof: false }
        );
    }

    #[test]
    fn test_read_error_propagates() {
        let mut reader = scripted(vec![Err(io::ErrorKind::ConnectionReset.into())]);
        let mut buf = BytesMut::new();
        let err = read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_drain_stops_at_limit() {
        let mut reader = scripted(vec![
            Ok(vec![b'a'; READ_CHUNK_SIZE]),
            Ok(vec![b'b'; READ_CHUNK_SIZE]),
            Ok(vec![b'c'; READ_CHUNK_SIZE]),
        ]);
        let mut buf = BytesMut::new();

        let outcome = read_available(&mut reader, &mut buf, 2 * READ_CHUNK_SIZE).unwrap();
        assert_eq!(
            outcome,
            ReadOutcome::Data { len: 2 * READ_CHUNK_SIZE, eof: false }
        );
        assert!(buf.iter().all(|&b| b != b'c'));

        // The rest is still there for the next event.
        buf.clear();
        assert_eq!(
            read_available(&mut reader, &mut buf, MAX_MESSAGE_SIZE).unwrap(),
            ReadOutcome::Data { len: READ_CHUNK_SIZE, eof: false }
        );
    }

    #[test]
    fn test_decode_replaces_invalid_utf8() {
        assert_eq!(decode(b"hi\xffthere"), "hi\u{FFFD}there");
        assert_eq!(decode("你好".as_bytes()), "你好");
    }

    #[test]
    fn test_format_and_write_response() {
        let response = format_response("响应:", "hello");
        assert_eq!(response, "响应:hello");

        let mut out = Vec::new();
        write_response(&mut out, &response).unwrap();
        assert_eq!(out, "响应:hello".as_bytes());
    }
}
