//! Chunk sanitization.

/// Removes control characters other than newline, tab and carriage return.
pub fn strip_control_chars(text: &str) -> String {
    text.chars().filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r')).collect()
}

/// Normalizes `\r\n` and lone `\r` to `\n`, including pairs split across chunks.
#[derive(Debug, Default)]
pub struct LineEndingNormalizer {
    pending_cr: bool,
}

impl LineEndingNormalizer {
    /// Normalizes one chunk. A trailing `\r` is held back until the next chunk.
    pub fn push(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                out.push('\n');
                if c == '\n' {
                    continue;
                }
            }
            if c == '\r' {
                self.pending_cr = true;
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Releases a held-back `\r` at end of stream.
    pub fn finish(&mut self) -> Option<&'static str> {
        std::mem::take(&mut self.pending_cr).then_some("\n")
    }
}
