use serde_json::Value;

/// A parsed Server-Sent Event.
#[derive(Debug)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: Option<Value>,
    /// The frame was the `[DONE]` sentinel.
    pub done: bool,
}

/// Incremental SSE decoder. Network chunks do not align with event
/// boundaries, so partial frames are buffered until their terminating blank
/// line arrives.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every completed event.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        while let Some(boundary) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..boundary + 2).collect();
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }
}

/// Parse one complete SSE frame (terminated text between blank lines).
/// Multiple `data:` lines are joined with newlines per the SSE spec.
fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event_type: Option<String> = None;
    let mut data = String::new();

    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        }
    }

    if data.is_empty() && event_type.is_none() {
        return None;
    }
    let data = data.trim().to_string();
    if data == "[DONE]" {
        return Some(SseEvent {
            event_type,
            data: None,
            done: true,
        });
    }
    Some(SseEvent {
        event_type,
        data: serde_json::from_str::<Value>(&data).ok(),
        done: false,
    })
}
