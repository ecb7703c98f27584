//! Bounded-length, CRLF-delimited line reading.
//!
//! See spec.md §4.1. Reads one byte at a time rather than relying on a
//! buffered `read_line`, so memory use is bounded by `max_line_length`
//! regardless of how the peer paces its bytes. The only line delimiter
//! is the literal sequence `CR LF`; a solo `CR` or `LF` is data.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads CRLF-delimited lines off of an `AsyncRead`, truncating any line
/// longer than `max_line_length` rather than growing without bound.
pub struct LineReader<R> {
    reader: R,
    max_line_length: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_length: usize) -> Self {
        LineReader { reader, max_line_length }
    }

    /// Reads the next line (without its terminator). Returns `Ok(None)`
    /// on a clean EOF with no undelivered partial line. A partial line
    /// still buffered when EOF is hit is discarded, not delivered, per
    /// spec.md §4.1.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf: Vec<u8> = Vec::new();
        let mut saw_cr = false;
        let mut byte = [0u8; 1];

        loop {
            let n = self.reader.read(&mut byte).await?;
            if n == 0 {
                return Ok(None);
            }
            let c = byte[0];

            if saw_cr {
                if c == b'\n' {
                    return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
                } else if c == b'\r' {
                    // Second CR right after an unterminated CR: the first
                    // is literal data, and we stay "just saw CR" for this one.
                    self.push(&mut buf, b'\r');
                } else {
                    self.push(&mut buf, b'\r');
                    saw_cr = false;
                    self.push(&mut buf, c);
                }
            } else if c == b'\r' {
                saw_cr = true;
            } else {
                // A solo LF (not preceded by CR) is data, not a delimiter.
                self.push(&mut buf, c);
            }
        }
    }

    fn push(&self, buf: &mut Vec<u8>, byte: u8) {
        if buf.len() < self.max_line_length {
            buf.push(byte);
        }
        // Bytes beyond max_line_length are silently dropped; the CRLF
        // state machine above still runs so the terminator is found.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn lines(input: &[u8]) -> Vec<Option<String>> {
        let mut reader = LineReader::new(Cursor::new(input.to_vec()), 10_000);
        let mut out = Vec::new();
        loop {
            match reader.read_line().await {
                Ok(Some(l)) => out.push(Some(l)),
                Ok(None) => {
                    out.push(None);
                    break;
                }
                Err(_) => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn splits_on_crlf_only() {
        let out = lines(b"hello\r\nworld\r\n").await;
        assert_eq!(out, vec![Some("hello".to_string()), Some("world".to_string()), None]);
    }

    #[tokio::test]
    async fn solo_lf_and_solo_cr_are_data() {
        let out = lines(b"a\nb\r\n").await;
        assert_eq!(out, vec![Some("a\nb".to_string()), None]);
    }

    #[tokio::test]
    async fn double_cr_then_lf_keeps_one_literal_cr() {
        // CR CR LF -> literal CR, then CRLF terminates.
        let out = lines(b"x\r\r\n").await;
        assert_eq!(out, vec![Some("x\r".to_string()), None]);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_discarded() {
        let out = lines(b"complete\r\npartial-no-terminator").await;
        assert_eq!(out, vec![Some("complete".to_string()), None]);
    }

    #[tokio::test]
    async fn overlong_line_truncates_to_exact_max() {
        let mut input = vec![b'x'; 10_250];
        input.extend_from_slice(b"\r\n");
        let mut reader = LineReader::new(Cursor::new(input), 10_000);
        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line.len(), 10_000);
    }
}
