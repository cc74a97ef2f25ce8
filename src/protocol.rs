//! SSE wire framing: event serialization and frame parsing.
//!
//! One event per frame, UTF-8 text only:
//!
//! ```text
//! id: <last-event-id>\n      (optional)
//! event: <event-name>\n      (optional)
//! data: <line>\n             (one per content line)
//! \n                          (blank line terminates the frame)
//! ```
//!
//! Comment frames (a line starting with `:`) carry no event and are used for
//! keep-alive. `retry: <ms>` frames carry the client reconnection hint.
//! [`parse_frames`] implements the receiving side, used by clients and by
//! round-trip tests.

use bytes::Bytes;

use crate::error::SseError;

/// Payload of a single event.
///
/// Strings and byte sequences are written verbatim (bytes lossily decoded as
/// UTF-8, since the wire format is text by definition); structured values are
/// carried as compact JSON text. [`EventData::None`] produces an event with
/// no `data:` lines at all, useful for sentinel/control events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventData {
    /// No payload: the frame carries no `data:` lines.
    #[default]
    None,
    /// Text payload, split on `\n` into one `data:` line per content line.
    /// The empty string still produces a single empty `data:` line.
    Text(String),
}

impl EventData {
    /// Encodes any serializable value as a compact JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Serialization`] if JSON encoding fails.
    pub fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self, SseError> {
        Ok(Self::Text(serde_json::to_string(value)?))
    }
}

impl From<&str> for EventData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for EventData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for EventData {
    fn from(bytes: Bytes) -> Self {
        Self::Text(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl From<serde_json::Value> for EventData {
    fn from(value: serde_json::Value) -> Self {
        // Value-to-string serialization cannot fail: all map keys are strings.
        Self::Text(value.to_string())
    }
}

/// A single outbound event, built up before being framed for the wire.
///
/// ```
/// use sse_relay::protocol::SseEvent;
///
/// let event = SseEvent::named("greeting").id("42").data("hello\nworld");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    /// Explicit event id. When absent, the owning session fills it from its
    /// running last-event-id counter.
    pub id: Option<String>,
    /// Event name for the `event:` line; omitted when `None`.
    pub name: Option<String>,
    /// Event payload.
    pub data: EventData,
}

impl SseEvent {
    /// Creates an empty, unnamed event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an event with the given `event:` name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Sets the `event:` name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets an explicit event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn data(mut self, data: impl Into<EventData>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets a JSON-encoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Serialization`] if JSON encoding fails.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Result<Self, SseError> {
        self.data = EventData::json(value)?;
        Ok(self)
    }
}

/// Serializes an event into one complete wire frame, blank line included.
#[must_use]
pub fn format_event(event: &SseEvent) -> String {
    let mut frame = String::new();
    if let Some(id) = &event.id {
        frame.push_str("id: ");
        frame.push_str(id);
        frame.push('\n');
    }
    if let Some(name) = &event.name {
        frame.push_str("event: ");
        frame.push_str(name);
        frame.push('\n');
    }
    if let EventData::Text(text) = &event.data {
        for line in text.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
    }
    frame.push('\n');
    frame
}

/// Formats a one-time client reconnection hint frame.
#[must_use]
pub fn retry_frame(ms: u64) -> String {
    format!("retry: {ms}\n\n")
}

/// Formats a comment frame. An empty `text` produces a bare `:` line, which
/// is what the keep-alive timer sends.
#[must_use]
pub fn comment_frame(text: &str) -> String {
    if text.is_empty() {
        ":\n\n".to_string()
    } else {
        format!(": {text}\n\n")
    }
}

/// A single event recovered from wire text by [`parse_frames`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEvent {
    /// Value of the `id:` field, if present.
    pub id: Option<String>,
    /// Value of the `event:` field, if present.
    pub name: Option<String>,
    /// All `data:` lines joined with `\n`; `None` when the frame carried no
    /// data lines.
    pub data: Option<String>,
    /// Value of the `retry:` field, if present and numeric.
    pub retry: Option<u64>,
}

/// Parses wire text into the events it carries.
///
/// Frames are delimited by blank lines; comment lines are skipped; one
/// leading space after the field colon is stripped. Unlike the browser
/// `EventSource` algorithm this parser also yields frames that carried
/// fields but no data lines, so sentinel events survive a round trip.
#[must_use]
pub fn parse_frames(input: &str) -> Vec<ParsedEvent> {
    let mut events = Vec::new();
    let mut current = ParsedEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;

    for line in input.split('\n') {
        if line.is_empty() {
            if saw_field {
                current.data = (!data_lines.is_empty()).then(|| data_lines.join("\n"));
                events.push(std::mem::take(&mut current));
            }
            data_lines.clear();
            saw_field = false;
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => current.id = Some(value.to_string()),
            "event" => current.name = Some(value.to_string()),
            "data" => data_lines.push(value),
            "retry" => current.retry = value.parse().ok(),
            _ => {}
        }
        saw_field = true;
    }
    events
}
