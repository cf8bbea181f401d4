//! Character-bounded accumulation of remote output.

/// Per-stream cap on captured command output, in Unicode scalar values.
pub const MAX_OUTPUT_CHARS: usize = 25_000;

/// Accumulates a byte stream as text, keeping at most `limit` characters.
///
/// Multi-byte sequences split across chunks are reassembled; bytes that can
/// never form valid UTF-8 are replaced with U+FFFD. Once the limit is hit
/// further input is discarded and `truncated` is set.
#[derive(Debug)]
pub struct BoundedText {
    text: String,
    chars: usize,
    limit: usize,
    pending: Vec<u8>,
    truncated: bool,
}

impl Default for BoundedText {
    fn default() -> Self {
        Self::new(MAX_OUTPUT_CHARS)
    }
}

impl BoundedText {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
            pending: Vec::new(),
            truncated: false,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn char_count(&self) -> usize {
        self.chars
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.append(valid);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        self.append(valid);
                    }
                    if self.truncated {
                        return;
                    }
                    match err.error_len() {
                        Some(bad) => {
                            self.append("\u{FFFD}");
                            rest = &after[bad..];
                        }
                        None => {
                            // incomplete sequence at the end; wait for more
                            self.pending = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Append already-decoded text, honouring the limit.
    pub fn append(&mut self, s: &str) {
        if self.truncated || s.is_empty() {
            return;
        }
        let room = self.limit - self.chars;
        let (prefix, taken, cut) = decode_prefix(s, room);
        self.text.push_str(prefix);
        self.chars += taken;
        if cut {
            self.truncated = true;
            self.pending.clear();
        }
    }

    /// Flush any dangling partial sequence and return `(text, truncated)`.
    pub fn finish(mut self) -> (String, bool) {
        if !self.pending.is_empty() && !self.truncated {
            self.pending.clear();
            self.append("\u{FFFD}");
        }
        (self.text, self.truncated)
    }
}

/// Longest prefix of `s` holding at most `max_chars` characters.
///
/// Returns the prefix, its character count and whether anything was cut.
fn decode_prefix(s: &str, max_chars: usize) -> (&str, usize, bool) {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&s[..byte_idx], max_chars, true),
        None => (s, s.chars().count(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_short_output_intact() {
        let mut out = BoundedText::default();
        out.push(b"hello\n");
        out.push(b"world\n");
        assert_eq!(out.finish(), ("hello\nworld\n".to_string(), false));
    }

    #[test]
    fn truncates_at_exact_char_limit() {
        let mut out = BoundedText::new(5);
        out.push(b"abc");
        out.push(b"defgh");
        assert!(out.is_truncated());
        out.push(b"ignored");
        assert_eq!(out.finish(), ("abcde".to_string(), true));
    }

    #[test]
    fn exactly_at_limit_is_not_truncated() {
        let mut out = BoundedText::new(4);
        out.push(b"abcd");
        assert_eq!(out.finish(), ("abcd".to_string(), false));
    }

    #[test]
    fn counts_characters_not_bytes() {
        let mut out = BoundedText::new(3);
        out.push("héé".as_bytes());
        assert_eq!(out.char_count(), 3);
        assert!(!out.is_truncated());
        out.push("é".as_bytes());
        assert_eq!(out.finish(), ("héé".to_string(), true));
    }

    #[test]
    fn reassembles_split_sequences() {
        let euro = "€".as_bytes();
        let mut out = BoundedText::default();
        out.push(&euro[..1]);
        out.push(&euro[1..2]);
        out.push(&euro[2..]);
        assert_eq!(out.finish().0, "€");
    }

    #[test]
    fn replaces_invalid_bytes() {
        let mut out = BoundedText::default();
        out.push(&[b'a', 0xff, b'b']);
        assert_eq!(out.finish().0, "a\u{FFFD}b");
    }

    #[test]
    fn dangling_partial_sequence_is_replaced_on_finish() {
        let mut out = BoundedText::default();
        out.push(&[b'x', 0xe2, 0x82]);
        assert_eq!(out.finish().0, "x\u{FFFD}");
    }

    #[test]
    fn large_output_caps_at_default_limit() {
        let mut out = BoundedText::default();
        let chunk = vec![b'y'; 8192];
        for _ in 0..5 {
            out.push(&chunk);
        }
        let (text, truncated) = out.finish();
        assert!(truncated);
        assert_eq!(text.chars().count(), MAX_OUTPUT_CHARS);
    }
}
