//! Minimal server-sent-events parsing shared by the SSE backends.

/// Parse one SSE block (the text between blank-line separators) into
/// `(event_type, data)`. Multiple `data:` lines are joined with newlines;
/// a missing `event:` line yields the default type `message`.
pub fn parse_block(block: &str) -> Option<(String, String)> {
    let mut event_type = "message".to_string();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (:) and unknown fields are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some((event_type, data_lines.join("\n")))
}

/// Incremental splitter: feed byte chunks, get back complete SSE blocks.
#[derive(Default)]
pub struct SseBuffer {
    buffer: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete block.
    pub fn push(&mut self, chunk: &str) -> Vec<(String, String)> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Drain whatever remains after the stream ends (a final block without
    /// a trailing blank line).
    pub fn finish(&mut self) -> Option<(String, String)> {
        let remaining = std::mem::take(&mut self.buffer);
        if remaining.trim().is_empty() {
            return None;
        }
        parse_block(&remaining)
    }
}
