// SSE event parser for upstream OpenAI-compatible streams.
//
// Feeds on raw byte chunks, splits on blank lines, and yields one event per
// `data:` payload. The terminator `data: [DONE]` is surfaced as its own
// variant so the forwarder can emit exactly one downstream [DONE].

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
}

pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some((pos, sep_len)) = find_event_boundary(&self.buffer) {
            let block = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + sep_len..].to_string();
            Self::parse_block(&block, &mut events);
        }
        events
    }

    pub fn flush(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let block = std::mem::take(&mut self.buffer);
        Self::parse_block(&block, &mut events);
        events
    }

    fn parse_block(block: &str, events: &mut Vec<SseEvent>) {
        for line in block.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    events.push(SseEvent::Data(value));
                }
            }
        }
    }
}

/// Events end on a blank line; both LF and CRLF framing appear in the wild.
fn find_event_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|p| (p, 2));
    let crlf = buffer.find("\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Serialize one downstream SSE event.
pub fn format_event(value: &Value) -> String {
    format!("data: {value}\n\n")
}

pub const DONE_EVENT: &str = "data: [DONE]\n\n";
