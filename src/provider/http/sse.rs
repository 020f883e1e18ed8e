//! Server-Sent Events (SSE) line framing.
//!
//! Providers send one JSON record per `data:` line. Network chunks split those
//! lines at arbitrary byte offsets, so the parser keeps the incomplete tail
//! between calls and only decodes a line once its terminator has arrived.

/// Incremental `data:` line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return the payloads of any complete `data:` lines.
    ///
    /// Other complete lines (`event:`, comments, blank separators) are dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(Self::parse_line)
            .collect()
    }

    fn parse_line(line: &[u8]) -> Option<String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let value = line.strip_prefix(b"data:")?;
        let value = value.strip_prefix(b" ").unwrap_or(value);
        Some(String::from_utf8_lossy(value).into_owned())
    }

    #[cfg(test)]
    /// Check if there's an incomplete line in the buffer.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop any incomplete trailing line. Returns the number of bytes discarded.
    pub fn finish(&mut self) -> usize {
        let pending = self.buffer.len();
        self.buffer.clear();
        pending
    }
}
