use relay_core::ToolCall;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug)]
struct OpenCall {
    id: String,
    name: String,
    buffer: String,
}

/// Rebuilds one tool call at a time from streamed argument fragments.
///
/// Only one call is open at once; a new `start` discards any unclosed
/// previous call.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    open: Option<OpenCall>,
}

impl ToolCallAssembler {
    /// Creates an assembler with no open call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a call, superseding any call still open.
    pub fn start(&mut self, id: impl Into<String>, name: impl Into<String>) {
        let id = id.into();
        if let Some(previous) = self.open.take() {
            debug!(
                superseded = %previous.id,
                buffered = previous.buffer.len(),
                next = %id,
                "Unclosed tool call superseded"
            );
        }
        self.open = Some(OpenCall {
            id,
            name: name.into(),
            buffer: String::new(),
        });
    }

    /// Appends argument text to the open call; ignored when none is open.
    pub fn push_fragment(&mut self, fragment: &str) -> bool {
        match self.open.as_mut() {
            Some(call) => {
                call.buffer.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Whether a call is open.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Id of the open call, if any.
    pub fn open_id(&self) -> Option<&str> {
        self.open.as_ref().map(|c| c.id.as_str())
    }

    /// Closes the open call and returns it with parsed arguments.
    ///
    /// Returns `None` when no call is open. Empty arguments become `{}`;
    /// arguments that are not valid JSON also become `{}` and are logged.
    pub fn finish(&mut self) -> Option<ToolCall> {
        let call = self.open.take()?;
        let input = parse_arguments(&call.id, &call.buffer);
        Some(ToolCall::new(call.id, call.name, input))
    }

    /// Drops the open call without producing it, returning its id.
    pub fn abandon(&mut self) -> Option<String> {
        self.open.take().map(|c| c.id)
    }
}

fn parse_arguments(id: &str, buffer: &str) -> Value {
    if buffer.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(buffer) {
        Ok(value) => value,
        Err(e) => {
            warn!(call_id = id, error = %e, "Malformed tool arguments, using empty object");
            Value::Object(serde_json::Map::new())
        }
    }
}
