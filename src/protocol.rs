//! Line protocol spoken by the pressure sensor.
//!
//! The device sends ASCII lines terminated with `\n`:
//!
//! - `PRESSURE:<number>[hPa]`: a reading, whitespace tolerated around tokens
//! - anything else: a free-text message
//!
//! The host sends one command per line (the identification text).
//!
//! [`decode`] classifies a single line and never fails. [`LineBuffer`]
//! assembles lines from the arbitrarily sized chunks a serial read returns.

use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ReceiveError;
use crate::events::EventKind;

/// Prefix identifying a pressure reading.
pub const PRESSURE_PREFIX: &str = "PRESSURE:";

/// Unit suffix accepted after the reading.
pub const PRESSURE_UNIT: &str = "hPa";

/// Line terminator in both directions.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Longest line accepted before the receiver gives up on finding a terminator.
pub const MAX_LINE_LENGTH: usize = 4096;

// Built from constants; compilation cannot fail.
#[allow(clippy::expect_used)]
static PRESSURE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^\s*{}\s*([+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+))\s*(?:{})?\s*$",
        regex::escape(PRESSURE_PREFIX),
        regex::escape(PRESSURE_UNIT),
    ))
    .expect("pressure pattern is valid")
});

/// Classify one received line.
///
/// A full match of the pressure grammar yields `Pressure`; every other line,
/// including a `PRESSURE:` line whose number does not parse, is returned whole
/// as a `Message`.
pub fn decode(line: &str) -> EventKind {
    PRESSURE_LINE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|number| number.as_str().parse::<f64>().ok())
        .map(|hpa| EventKind::Pressure { hpa })
        .unwrap_or_else(|| EventKind::message(line))
}

/// Format a command for the wire: trimmed text plus terminator.
///
/// Returns `None` for blank commands.
pub fn encode_command(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(LINE_TERMINATOR);
    Some(bytes)
}

/// Accumulates received bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held that are not yet part of a complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete line, decoded and trimmed.
    ///
    /// Blank lines come back as empty strings so the caller decides what to
    /// skip. `Ok(None)` means more data is needed. A line longer than
    /// [`MAX_LINE_LENGTH`] is an error whether or not its terminator has
    /// arrived yet.
    pub fn next_line(&mut self) -> Result<Option<String>, ReceiveError> {
        match self.buffer.iter().position(|&b| b == LINE_TERMINATOR) {
            Some(end) => {
                let line = self.buffer.split_to(end);
                self.buffer.advance(1);
                if line.len() > MAX_LINE_LENGTH {
                    return Err(ReceiveError::Overflow {
                        max: MAX_LINE_LENGTH,
                    });
                }
                let text = std::str::from_utf8(&line)?;
                Ok(Some(text.trim().to_string()))
            }
            None if self.buffer.len() > MAX_LINE_LENGTH => {
                self.buffer.clear();
                Err(ReceiveError::Overflow {
                    max: MAX_LINE_LENGTH,
                })
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure(hpa: f64) -> EventKind {
        EventKind::Pressure { hpa }
    }

    #[test]
    fn test_decode_reading_with_spaces_and_unit() {
        assert_eq!(decode("PRESSURE: 23.4 hPa"), pressure(23.4));
    }

    #[test]
    fn test_decode_signed_without_spaces() {
        assert_eq!(decode("PRESSURE:-5hPa"), pressure(-5.0));
        assert_eq!(decode("PRESSURE:+1013.25"), pressure(1013.25));
    }

    #[test]
    fn test_decode_fraction_forms() {
        assert_eq!(decode("PRESSURE:.5"), pressure(0.5));
        assert_eq!(decode("PRESSURE:12."), pressure(12.0));
        assert_eq!(decode("  PRESSURE:  1000  hPa  "), pressure(1000.0));
    }

    #[test]
    fn test_decode_unparsable_number_is_message() {
        assert_eq!(decode("PRESSURE:abc"), EventKind::message("PRESSURE:abc"));
        assert_eq!(decode("PRESSURE:"), EventKind::message("PRESSURE:"));
        assert_eq!(decode("PRESSURE:1.2.3"), EventKind::message("PRESSURE:1.2.3"));
    }

    #[test]
    fn test_decode_trailing_garbage_is_message() {
        assert_eq!(decode("PRESSURE:12 kPa"), EventKind::message("PRESSURE:12 kPa"));
        assert_eq!(decode("PRESSURE:1e3"), EventKind::message("PRESSURE:1e3"));
        assert_eq!(decode("PRESSURE:nan"), EventKind::message("PRESSURE:nan"));
    }

    #[test]
    fn test_decode_plain_text() {
        assert_eq!(decode("hello"), EventKind::message("hello"));
        assert_eq!(decode("pressure:12"), EventKind::message("pressure:12"));
    }

    #[test]
    fn test_decode_has_no_range_limit() {
        assert_eq!(decode("PRESSURE:99999999.9hPa"), pressure(99_999_999.9));
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(encode_command("  20231234 "), Some(b"20231234\n".to_vec()));
        assert_eq!(encode_command("   "), None);
    }

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"PRESS");
        assert_eq!(lines.next_line().unwrap(), None);
        lines.push(b"URE:1.0\r\nhel");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("PRESSURE:1.0"));
        assert_eq!(lines.next_line().unwrap(), None);
        lines.push(b"lo\n\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("hello"));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some(""));
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_line_buffer_rejects_invalid_utf8() {
        let mut lines = LineBuffer::new();
        lines.push(&[0xff, 0xfe, b'\n', b'o', b'k', b'\n']);
        assert!(matches!(lines.next_line(), Err(ReceiveError::Decode(_))));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn test_line_buffer_overflow() {
        let mut lines = LineBuffer::new();
        lines.push(&vec![b'x'; MAX_LINE_LENGTH + 1]);
        assert!(matches!(
            lines.next_line(),
            Err(ReceiveError::Overflow { max: MAX_LINE_LENGTH })
        ));
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_terminated_line_over_limit_rejected() {
        let mut lines = LineBuffer::new();
        let mut data = vec![b'1'; MAX_LINE_LENGTH + 512];
        data.push(b'\n');
        data.extend_from_slice(b"ok\n");
        lines.push(&data);

        assert!(matches!(
            lines.next_line(),
            Err(ReceiveError::Overflow { max: MAX_LINE_LENGTH })
        ));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn test_line_at_limit_accepted() {
        let mut lines = LineBuffer::new();
        let mut data = vec![b'x'; MAX_LINE_LENGTH];
        data.push(b'\n');
        lines.push(&data);
        assert_eq!(lines.next_line().unwrap().map(|l| l.len()), Some(MAX_LINE_LENGTH));
    }
}
