//! Line accumulator for modem replies.
//!
//! Bytes are collected until a `\n` completes a line. ASCII bytes are
//! appended directly; multi-byte UTF-8 sequences are held back until they
//! are complete and valid. Malformed input or a line longer than the
//! buffer resets the accumulator silently.

// ============================================================================
// Constants
// ============================================================================

/// Line buffer capacity in bytes.
pub(crate) const LINE_CAPACITY: usize = 128;

// ============================================================================
// LineBuffer
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
    seq: [u8; 4],
    seq_len: usize,
    seq_need: usize,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(LINE_CAPACITY),
            ..Self::default()
        }
    }

    /// Appends one byte. Returns `true` once a full line is available.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        if self.seq_need > 0 {
            if byte & 0xC0 != 0x80 {
                self.clear();
                return false;
            }
            self.seq[self.seq_len] = byte;
            self.seq_len += 1;
            if self.seq_len < self.seq_need {
                return false;
            }
            let complete = self.seq_len;
            self.seq_need = 0;
            self.seq_len = 0;
            if std::str::from_utf8(&self.seq[..complete]).is_err() {
                self.clear();
                return false;
            }
            let seq = self.seq;
            self.append(&seq[..complete]);
            return false;
        }

        let need = match byte {
            0x00..=0x7F => 1,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => {
                self.clear();
                return false;
            }
        };

        if need > 1 {
            self.seq[0] = byte;
            self.seq_len = 1;
            self.seq_need = need;
            return false;
        }

        self.append(&[byte]);
        byte == b'\n' && !self.buf.is_empty()
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.buf.len() + bytes.len() > LINE_CAPACITY {
            self.clear();
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the accumulated text.
    pub(crate) fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf).unwrap_or_default()
    }

    /// Takes the accumulated line, leaving the buffer empty.
    pub(crate) fn take(&mut self) -> String {
        let line = self.as_str().to_owned();
        self.clear();
        line
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.seq_len = 0;
        self.seq_need = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.seq_len == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn feed(buf: &mut LineBuffer, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if buf.push(byte) {
                lines.push(buf.take());
            }
        }
        lines
    }

    #[test]
    fn test_splits_lines() {
        let mut buf = LineBuffer::new();
        let lines = feed(&mut buf, b"OK\r\n+CSQ: 20,0\r\n");
        assert_eq!(lines, vec!["OK\r\n", "+CSQ: 20,0\r\n"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multibyte_sequence() {
        let mut buf = LineBuffer::new();
        let lines = feed(&mut buf, "Č€\r\n".as_bytes());
        assert_eq!(lines, vec!["Č€\r\n"]);
    }

    #[test]
    fn test_invalid_sequence_resets() {
        let mut buf = LineBuffer::new();
        let lines = feed(&mut buf, b"AB\xC3(\r\nOK\r\n");
        // The broken line loses everything before the bad byte.
        assert_eq!(lines, vec!["\r\n", "OK\r\n"]);
    }

    #[test]
    fn test_overflow_resets() {
        let mut buf = LineBuffer::new();
        let long = vec![b'x'; LINE_CAPACITY + 10];
        assert!(feed(&mut buf, &long).is_empty());
        let lines = feed(&mut buf, b"\r\nOK\r\n");
        assert_eq!(lines.last().map(String::as_str), Some("OK\r\n"));
        assert!(lines.iter().all(|l| l.len() <= LINE_CAPACITY));
    }

    proptest! {
        #[test]
        fn prop_valid_lines_roundtrip(text in "[^\r\n]{0,30}") {
            let mut buf = LineBuffer::new();
            let line = format!("{text}\r\n");
            let lines = feed(&mut buf, line.as_bytes());
            prop_assert_eq!(lines, vec![line]);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = LineBuffer::new();
            for line in feed(&mut buf, &data) {
                prop_assert!(line.len() <= LINE_CAPACITY);
                prop_assert!(line.ends_with('\n'));
            }
        }
    }
}
