//! Line framing for gateway byte streams

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

/// Longest line accepted before the buffer is discarded
const MAX_LINE_LEN: usize = 512;

/// Accumulates bytes and splits them into lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_LINE_LEN),
        }
    }

    /// Append bytes read from the device
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete line, without its terminator
    ///
    /// Invalid UTF-8 is replaced rather than rejected; the framer reports the
    /// line if it is then malformed.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_LINE_LEN {
                    warn!(discarded = self.buffer.len(), "Discarding overlong line");
                    self.buffer.clear();
                }
                return None;
            };
            let line = self.buffer.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim_end_matches('\r').trim_start_matches('\0');
            if text.is_empty() {
                continue;
            }
            trace!(len = text.len(), "Line received");
            return Some(text.to_string());
        }
    }

    /// Bytes held for an incomplete line
    pub fn pending(&self) -> usize {
        self.buffer.remaining()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_lines() {
        let mut lines = LineBuffer::new();
        lines.extend(b"045  I --- 04:056053 --:------ 01:145038 30C9 003 0007C1\r\n# evofw3");
        assert_eq!(
            lines.next_line().as_deref(),
            Some("045  I --- 04:056053 --:------ 01:145038 30C9 003 0007C1")
        );
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.pending(), 8);

        lines.extend(b" 0.7.1\n");
        assert_eq!(lines.next_line().as_deref(), Some("# evofw3 0.7.1"));
    }

    #[test]
    fn test_skips_empty_lines() {
        let mut lines = LineBuffer::new();
        lines.extend(b"\r\n\r\nabc\n");
        assert_eq!(lines.next_line().as_deref(), Some("abc"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn test_discards_overlong_line() {
        let mut lines = LineBuffer::new();
        lines.extend(&[b'A'; MAX_LINE_LEN + 1]);
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut lines = LineBuffer::new();
        lines.extend(b"RQ \xFF\n");
        assert_eq!(lines.next_line().as_deref(), Some("RQ \u{FFFD}"));
    }
}
