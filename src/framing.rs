//! Newline-delimited message framing for JSON-RPC over TCP.
//!
//! Every encoded message ends with a single `\n`. Bytes arrive from the
//! socket in arbitrary-sized chunks; [`LineFramer`] accumulates them and
//! yields each complete line as a frame, retaining any partial trailing
//! data until the remainder arrives.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","id":"req_1","result":{"x":1}}\n
//! {"jsonrpc":"2.0","id":"req_2","result":null}\n
//! ```
//!
//! A trailing `\r` before the delimiter is stripped and blank lines are
//! skipped. Malformed frames are reported as [`BridgeError::Protocol`]
//! without abandoning the stream.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

/// Message delimiter.
pub const DELIMITER: u8 = b'\n';

/// Maximum frame size (100MB) to prevent OOM from malicious/buggy workers.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Incremental line splitter.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_frame_size: usize,
    /// Set after an oversized frame; bytes are dropped until the next delimiter.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
            discarding: false,
        }
    }

    /// Feed a chunk of bytes, returning every frame it completes.
    ///
    /// Frames are returned in stream order. A malformed frame produces an
    /// `Err` entry in place of that frame; later frames are unaffected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, BridgeError>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == DELIMITER) {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                // End of the oversized frame we already reported.
                self.discarding = false;
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(line);
            let frame = std::mem::take(&mut self.buf);
            if let Some(result) = self.finish(frame) {
                frames.push(result);
            }
        }

        if !self.discarding && !rest.is_empty() {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_frame_size {
                frames.push(Err(self.oversized(self.buf.len())));
                self.buf = Vec::new();
                self.discarding = true;
            }
        }

        frames
    }

    /// Bytes held back waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame, e.g. when the underlying socket is replaced.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    fn finish(&self, mut frame: Vec<u8>) -> Option<Result<String, BridgeError>> {
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if frame.len() > self.max_frame_size {
            return Some(Err(self.oversized(frame.len())));
        }
        Some(
            String::from_utf8(frame)
                .map_err(|e| BridgeError::Protocol(format!("Frame is not valid UTF-8: {e}"))),
        )
    }

    fn oversized(&self, size: usize) -> BridgeError {
        BridgeError::Protocol(format!(
            "Frame size {} exceeds maximum {} bytes",
            size, self.max_frame_size
        ))
    }
}

/// Write one already-encoded frame and flush it.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    debug_assert_eq!(frame.last(), Some(&DELIMITER), "frame must be delimited");
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn ok_frames(results: Vec<Result<String, BridgeError>>) -> Vec<String> {
        results
            .into_iter()
            .map(|r| r.expect("frame should decode"))
            .collect()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut framer = LineFramer::new();
        let frames = ok_frames(framer.push(b"{\"id\":\"req_1\"}\n"));
        assert_eq!(frames, vec![r#"{"id":"req_1"}"#.to_string()]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"id\":").is_empty());
        assert_eq!(framer.buffered(), 6);
        assert!(framer.push(b"\"req_1\"").is_empty());

        let frames = ok_frames(framer.push(b"}\n"));
        assert_eq!(frames, vec![r#"{"id":"req_1"}"#.to_string()]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut framer = LineFramer::new();
        let frames = ok_frames(framer.push(b"{\"a\":1}\n{\"b\":2}\n{\"c\""));
        assert_eq!(frames, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
        assert_eq!(framer.buffered(), 4);

        let frames = ok_frames(framer.push(b":3}\n"));
        assert_eq!(frames, vec![r#"{"c":3}"#.to_string()]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut framer = LineFramer::new();
        let input = b"{\"id\":\"req_1\",\"result\":true}\n{\"id\":\"req_2\",\"result\":false}\n";
        let mut frames = Vec::new();
        for byte in input.iter() {
            frames.extend(ok_frames(framer.push(std::slice::from_ref(byte))));
        }
        assert_eq!(
            frames,
            vec![
                r#"{"id":"req_1","result":true}"#.to_string(),
                r#"{"id":"req_2","result":false}"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut framer = LineFramer::new();
        let frames = ok_frames(framer.push(b"\n\r\n{\"a\":1}\r\n   \n{\"b\":2}\n"));
        assert_eq!(frames, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
    }

    #[test]
    fn test_invalid_utf8_does_not_abandon_stream() {
        let mut framer = LineFramer::new();
        let mut input = Vec::new();
        input.extend_from_slice(b"{\"a\":1}\n");
        input.extend_from_slice(&[0xff, 0xfe, b'\n']);
        input.extend_from_slice(b"{\"b\":2}\n");

        let results = framer.push(&input);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(BridgeError::Protocol(_))));
        assert_eq!(results[2].as_ref().expect("third frame"), r#"{"b":2}"#);
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut framer = LineFramer::with_max_frame_size(8);

        let results = framer.push(b"0123456789abcdef");
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "got: {err}");
        assert_eq!(framer.buffered(), 0);

        // The tail of the oversized frame is dropped, the next frame survives.
        assert!(framer.push(b"more junk").is_empty());
        let frames = ok_frames(framer.push(b"tail\nok\n"));
        assert_eq!(frames, vec!["ok".to_string()]);
    }

    #[test]
    fn test_oversized_frame_within_one_chunk() {
        let mut framer = LineFramer::with_max_frame_size(4);
        let results = framer.push(b"too long\nok\n");
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().expect("second frame"), "ok");
    }

    #[test]
    fn test_frame_exactly_at_size_limit() {
        let mut framer = LineFramer::with_max_frame_size(4);
        let frames = ok_frames(framer.push(b"abcd\n"));
        assert_eq!(frames, vec!["abcd".to_string()]);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut framer = LineFramer::new();
        framer.push(b"{\"half");
        framer.reset();
        assert_eq!(framer.buffered(), 0);
        let frames = ok_frames(framer.push(b"{\"whole\":1}\n"));
        assert_eq!(frames, vec![r#"{"whole":1}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_write_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"{\"id\":\"req_1\"}\n")
            .await
            .expect("Write failed");
        drop(client);

        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, server.read_to_end(&mut received))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        let mut framer = LineFramer::new();
        let frames = ok_frames(framer.push(&received));
        assert_eq!(frames, vec![r#"{"id":"req_1"}"#.to_string()]);
    }
}
