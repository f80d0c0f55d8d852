//! Server-Sent Events line parser, for the LLM Client's streaming responses
//! (§4.7: "SSE format: lines beginning `data: <json>`; terminate on
//! `data: [DONE]`").
//!
//! Ported near-verbatim from the SSE parser used by the chat-completions
//! provider this crate is grounded on, which already implements the exact
//! incremental-parsing behavior required here.

/// A single parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` stream-termination sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
struct EventBuilder {
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl EventBuilder {
    fn has_data(&self) -> bool {
        !self.data_lines.is_empty()
    }

    fn build(&mut self) -> SseEvent {
        let event = SseEvent {
            event_type: self.event_type.take(),
            data: self.data_lines.join("\n"),
            id: self.id.take(),
        };
        self.data_lines.clear();
        event
    }

    /// Feed one line (without its trailing newline). Returns a completed
    /// event when `line` is the blank line terminating an event block.
    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return if self.has_data() { Some(self.build()) } else { None };
        }
        if line.starts_with(':') {
            return None; // comment line, per SSE spec
        }
        let Some((field, value)) = parse_field(line) else {
            return None;
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {} // unknown fields ignored per SSE spec
        }
        None
    }
}

/// Split a raw SSE `field:value` line, stripping exactly one leading space
/// from the value as the SSE spec requires.
fn parse_field(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let field = &line[..colon];
    let mut value = &line[colon + 1..];
    if let Some(stripped) = value.strip_prefix(' ') {
        value = stripped;
    }
    Some((field, value))
}

/// Parse a complete block of SSE text in one shot.
pub fn parse_sse_text(text: &str) -> Vec<SseEvent> {
    let mut builder = EventBuilder::default();
    let mut events = Vec::new();
    for line in text.lines() {
        if let Some(event) = builder.process_line(line) {
            events.push(event);
        }
    }
    if builder.has_data() {
        events.push(builder.build());
    }
    events
}

/// Incremental SSE parser for streaming byte chunks off an HTTP response
/// body, where events may split across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseLineParser {
    line_buffer: String,
    builder: EventBuilder,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw byte chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                let mut line = std::mem::take(&mut self.line_buffer);
                if line.ends_with('\r') {
                    line.pop();
                }
                if let Some(event) = self.builder.process_line(&line) {
                    events.push(event);
                }
            } else {
                self.line_buffer.push(ch);
            }
        }
        events
    }

    /// Flush any remaining buffered partial line and trailing event, once
    /// the byte stream has ended.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let line = line.strip_suffix('\r').map(str::to_string).unwrap_or(line);
            if let Some(event) = self.builder.process_line(&line) {
                return Some(event);
            }
        }
        if self.builder.has_data() {
            Some(self.builder.build())
        } else {
            None
        }
    }
}
