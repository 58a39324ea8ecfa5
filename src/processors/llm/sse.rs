//! Incremental Server-Sent-Events parsing for chat-completion streams.
//!
//! The provider stream arrives as arbitrary byte chunks; this parser
//! reassembles lines, collects `data:` fields into events at each blank
//! line, and recognizes the `[DONE]` terminator. Event types, ids, and
//! comment lines are accepted and discarded — only data payloads matter
//! to the completions protocol.

/// One parsed SSE event: the joined `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The data payload. Multiple `data:` lines are joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incrementally parses SSE bytes into events.
///
/// Feed chunks with [`push`](Self::push) as they arrive; call
/// [`flush`](Self::flush) at end of stream to emit a trailing event that
/// never saw its blank-line terminator.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes, returning any events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.line_buffer);
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if let Some(event) = self.take_line(line) {
                    events.push(event);
                }
            } else {
                self.line_buffer.push(ch);
            }
        }
        events
    }

    /// Emit any buffered event at end of stream.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            let event = self.take_line(line);
            if event.is_some() {
                return event;
            }
        }
        self.build()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        // Blank line terminates the pending event.
        if line.is_empty() {
            return self.build();
        }
        // Comment line.
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = field_value(line, "data") {
            self.data_lines.push(value.to_owned());
        }
        // event:/id:/retry: fields carry nothing for this protocol.
        None
    }

    fn build(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

/// Extract the value of `field:` from a line, stripping one leading space.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
