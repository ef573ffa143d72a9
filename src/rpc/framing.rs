//! Newline-delimited message framing for JSON-RPC over stdio pipes.
//!
//! Every message is a single JSON object serialized on one line and
//! terminated by `\n`. `serde_json` escapes control characters inside
//! strings, so a compact serialization never contains a raw newline and the
//! line boundary is always the message boundary.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","method":"echo","params":[1],"id":1}\n
//! {"jsonrpc":"2.0","result":1,"id":1}\n
//! ```
//!
//! Both CRLF and LF terminators are accepted on read.

use std::io::{BufRead, Read, Write};

use anyhow::{anyhow, Context, Result};

/// Maximum line size (100MB) to prevent OOM from a misbehaving server.
pub(crate) const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Read one newline-terminated message from the stream.
///
/// Returns `Ok(None)` on a clean EOF (the server closed its output).
/// The returned string has its line terminator stripped.
///
/// # Errors
///
/// Returns an error if:
/// - The underlying read fails
/// - The line exceeds MAX_MESSAGE_SIZE (100MB) without a terminator
/// - The line is not valid UTF-8
pub(crate) fn read_line_message<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let bytes_read = reader
        .by_ref()
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .context("Failed to read message line")?;

    // EOF - server closed its output
    if bytes_read == 0 {
        return Ok(None);
    }

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message size exceeds maximum {} bytes",
            MAX_MESSAGE_SIZE
        ));
    }

    // Trim both CRLF and LF line endings
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    String::from_utf8(buf)
        .map(Some)
        .context("Message line is not valid UTF-8")
}

/// Write one message followed by `\n` and flush immediately.
///
/// The body must not contain a raw newline; compact `serde_json` output
/// never does.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub(crate) fn write_line_message<W: Write + ?Sized>(writer: &mut W, body: &str) -> Result<()> {
    debug_assert!(!body.contains('\n'), "framed message contains a newline");

    let mut line = Vec::with_capacity(body.len() + 1);
    line.extend_from_slice(body.as_bytes());
    line.push(b'\n');

    writer
        .write_all(&line)
        .context("Failed to write message line")?;
    writer.flush().context("Failed to flush message")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_write_read_roundtrip() {
        let message = r#"{"jsonrpc":"2.0","method":"test","params":[],"id":1}"#;

        let mut wire = Vec::new();
        write_line_message(&mut wire, message).expect("Write failed");
        assert_eq!(wire.last(), Some(&b'\n'));

        let mut reader = Cursor::new(wire);
        let received = read_line_message(&mut reader)
            .expect("Read failed")
            .expect("Unexpected EOF");

        assert_eq!(received, message);
    }

    #[test]
    fn test_read_consecutive_lines() {
        let raw = "{\"id\":1}\n{\"id\":2}\n";
        let mut reader = BufReader::new(raw.as_bytes());

        assert_eq!(
            read_line_message(&mut reader).unwrap().as_deref(),
            Some("{\"id\":1}")
        );
        assert_eq!(
            read_line_message(&mut reader).unwrap().as_deref(),
            Some("{\"id\":2}")
        );
        assert_eq!(read_line_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_read_handles_crlf_and_lf() {
        let raw = "{\"crlf\":true}\r\n{\"lf\":true}\n";
        let mut reader = BufReader::new(raw.as_bytes());

        assert_eq!(
            read_line_message(&mut reader).unwrap().as_deref(),
            Some("{\"crlf\":true}")
        );
        assert_eq!(
            read_line_message(&mut reader).unwrap().as_deref(),
            Some("{\"lf\":true}")
        );
    }

    #[test]
    fn test_read_final_line_without_terminator() {
        let mut reader = BufReader::new("{\"id\":3}".as_bytes());
        assert_eq!(
            read_line_message(&mut reader).unwrap().as_deref(),
            Some("{\"id\":3}")
        );
        assert_eq!(read_line_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_connection_closed_returns_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert_eq!(read_line_message(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_read_rejects_invalid_utf8() {
        let mut reader = BufReader::new(&b"\xff\xfe\n"[..]);
        let err = read_line_message(&mut reader).unwrap_err();
        assert!(
            err.to_string().contains("UTF-8"),
            "Expected UTF-8 error, got: {}",
            err
        );
    }

    #[test]
    fn test_serialized_json_never_contains_raw_newline() {
        let value = serde_json::json!({"text": "line one\nline two\r\n"});
        let body = serde_json::to_string(&value).unwrap();

        let mut wire = Vec::new();
        write_line_message(&mut wire, &body).unwrap();

        let newlines = wire.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
    }
}
