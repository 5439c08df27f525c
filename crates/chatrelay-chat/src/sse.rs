//! Line framing for upstream event streams.
//!
//! Network reads do not respect line boundaries, so bytes are buffered until
//! a `\n` arrives. Complete lines are reduced to their payload: `data:` fields
//! are unwrapped, other SSE fields and comments are dropped, and bare lines
//! (newline-delimited JSON) pass through unchanged.

/// Incremental splitter from raw body bytes to payload lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    finished: bool,
}

impl LineFramer {
    /// Feed bytes, returning every payload line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = frame_line(&String::from_utf8_lossy(&raw)) {
                lines.push(payload);
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<String> {
        self.finished = true;
        let raw = std::mem::take(&mut self.buffer);
        frame_line(&String::from_utf8_lossy(&raw))
            .into_iter()
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Reduce one raw line to its payload, or `None` if it carries nothing.
pub fn frame_line(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        return if data.is_empty() {
            None
        } else {
            Some(data.to_string())
        };
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return None;
    }
    Some(line.to_string())
}
