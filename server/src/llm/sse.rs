//! Line-buffering SSE parser for vendor LLM streaming responses.
//!
//! Two things make this non-trivial: TCP chunks don't align with line
//! boundaries, and `data:` lines within one SSE event can be split across
//! several lines (joined with `\n`) before the blank line that terminates
//! the event. Both are handled here so callers just get complete event
//! bodies.

pub struct SseLineBuffer {
    /// Bytes received but not yet terminated by `\n`.
    partial_line: String,
    /// `data:` lines accumulated for the event currently being assembled.
    block: Vec<String>,
}

impl Default for SseLineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self {
            partial_line: String::new(),
            block: Vec::new(),
        }
    }

    /// Feeds raw bytes from one read, returning any complete event bodies
    /// (joined multi-line `data:` payloads) they completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(bytes);
        self.partial_line.push_str(&text);

        let mut events = Vec::new();
        loop {
            let Some(newline_pos) = self.partial_line.find('\n') else {
                break;
            };
            let line = self.partial_line[..newline_pos]
                .trim_end_matches('\r')
                .to_string();
            self.partial_line.drain(..=newline_pos);
            self.consume_line(line, &mut events);
        }
        events
    }

    /// Call once the underlying byte stream has ended. Any buffered,
    /// unterminated block is emitted as a final event.
    pub fn flush(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.block.is_empty() {
            events.push(self.block.join("\n"));
            self.block.clear();
        }
        events
    }

    fn consume_line(&mut self, line: String, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.block.is_empty() {
                events.push(std::mem::take(&mut self.block).join("\n"));
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.block.push(rest.trim_start().to_string());
        }
        // Other SSE fields (event:, id:, retry:) are ignored.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_event_split_across_chunks() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: {\"a\":").is_empty());
        let events = buf.feed(b"1}\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn joins_multiline_data_block() {
        let mut buf = SseLineBuffer::new();
        let events = buf.feed(b"data: line one\ndata: line two\n\n");
        assert_eq!(events, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn ignores_comment_lines() {
        let mut buf = SseLineBuffer::new();
        let events = buf.feed(b": keep-alive\ndata: hi\n\n");
        assert_eq!(events, vec!["hi".to_string()]);
    }

    #[test]
    fn flush_emits_unterminated_block() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: trailing").is_empty());
        assert_eq!(buf.flush(), vec!["trailing".to_string()]);
    }
}
