//! Protocol state machine for one provider round trip.
//!
//! ```text
//! idle → streaming
//! streaming → tool_use | done
//! tool_use → executing
//! executing → streaming | done
//! done → idle            (reset only)
//! ```
//!
//! Any other transition is a transport or parsing bug and fails with
//! [`RelayError::InvalidTransition`] naming the pair.

use relay_core::{ListenerHandle, Listeners, RelayError, RelayResult, ToolCall};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Where a round trip is in the streaming protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No request in flight.
    #[default]
    Idle,
    /// Receiving assistant output.
    Streaming,
    /// A tool call's arguments are streaming.
    ToolUse,
    /// A tool call is complete and awaiting execution.
    Executing,
    /// The round trip finished.
    Done,
}

impl StreamState {
    /// Snake-case name used in errors and events.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::ToolUse => "tool_use",
            StreamState::Executing => "executing",
            StreamState::Done => "done",
        }
    }

    /// Whether the transition table allows `self → next`.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Streaming)
                | (Streaming, ToolUse)
                | (Streaming, Done)
                | (ToolUse, Executing)
                | (Executing, Streaming)
                | (Executing, Done)
                | (Done, Idle)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications emitted by [`StreamStateMachine`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// A transition was applied.
    StateChange {
        /// Previous state.
        from: StreamState,
        /// New state.
        to: StreamState,
    },
    /// Assistant text arrived.
    Text {
        /// The fragment.
        text: String,
    },
    /// A tool call opened.
    ToolCallStart {
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A tool call closed with its parsed arguments.
    ToolCallEnd {
        /// The completed call.
        call: ToolCall,
    },
}

/// Enforces legal event sequencing and notifies listeners of every step.
///
/// Listeners run synchronously on the caller's task; a panicking listener
/// is logged and skipped.
#[derive(Default)]
pub struct StreamStateMachine {
    state: StreamState,
    listeners: Listeners<ProtocolEvent>,
}

impl StreamStateMachine {
    /// Creates a machine in `idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Registers a listener; the handle unregisters it.
    pub fn on_event<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&ProtocolEvent) + Send + Sync + 'static,
    {
        self.listeners.register(callback)
    }

    /// Applies `self.state → to` if the table allows it.
    pub fn transition(&mut self, to: StreamState) -> RelayResult<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(RelayError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.state = to;
        trace!(%from, %to, "Stream state change");
        self.listeners.emit(&ProtocolEvent::StateChange { from, to });
        Ok(())
    }

    /// `idle → streaming`: a request was sent.
    pub fn begin(&mut self) -> RelayResult<()> {
        self.transition(StreamState::Streaming)
    }

    /// Records a text fragment, resuming `streaming` after an executed call.
    pub fn text(&mut self, fragment: &str) -> RelayResult<()> {
        if self.state == StreamState::Executing {
            self.transition(StreamState::Streaming)?;
        }
        if self.state != StreamState::Streaming {
            return Err(RelayError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: StreamState::Streaming.as_str().to_string(),
            });
        }
        self.listeners.emit(&ProtocolEvent::Text {
            text: fragment.to_string(),
        });
        Ok(())
    }

    /// Enters `tool_use` for a new call.
    pub fn tool_call_start(&mut self, id: &str, name: &str) -> RelayResult<()> {
        if self.state == StreamState::Executing {
            self.transition(StreamState::Streaming)?;
        }
        self.transition(StreamState::ToolUse)?;
        self.listeners.emit(&ProtocolEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// `tool_use → executing` with the completed call.
    pub fn tool_call_end(&mut self, call: &ToolCall) -> RelayResult<()> {
        self.transition(StreamState::Executing)?;
        self.listeners.emit(&ProtocolEvent::ToolCallEnd { call: call.clone() });
        Ok(())
    }

    /// `tool_use → executing` for a call that was dropped unfinished.
    pub fn abandon_tool_call(&mut self) -> RelayResult<()> {
        self.transition(StreamState::Executing)
    }

    /// Marks the round trip finished.
    pub fn finish(&mut self) -> RelayResult<()> {
        self.transition(StreamState::Done)
    }

    /// `done → idle`; only legal after the round trip finished.
    pub fn reset(&mut self) -> RelayResult<()> {
        self.transition(StreamState::Idle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn recorder(machine: &StreamStateMachine) -> (Arc<Mutex<Vec<ProtocolEvent>>>, ListenerHandle) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        let handle = machine.on_event(move |ev| e.lock().push(ev.clone()));
        (events, handle)
    }

    #[test]
    fn text_only_round_trip() {
        let mut m = StreamStateMachine::new();
        let (events, _h) = recorder(&m);
        m.begin().unwrap();
        m.text("Hello").unwrap();
        m.finish().unwrap();
        assert_eq!(m.state(), StreamState::Done);
        m.reset().unwrap();
        assert_eq!(m.state(), StreamState::Idle);
        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[1],
            ProtocolEvent::Text {
                text: "Hello".into()
            }
        );
    }

    #[test]
    fn tool_round_trip_with_two_calls() {
        let mut m = StreamStateMachine::new();
        m.begin().unwrap();
        m.tool_call_start("a", "search").unwrap();
        m.tool_call_end(&ToolCall::new("a", "search", json!({}))).unwrap();
        m.tool_call_start("b", "read").unwrap();
        m.tool_call_end(&ToolCall::new("b", "read", json!({}))).unwrap();
        m.finish().unwrap();
        assert_eq!(m.state(), StreamState::Done);
    }

    #[test]
    fn illegal_transition_names_the_pair() {
        let mut m = StreamStateMachine::new();
        let err = m.finish().unwrap_err();
        match err {
            RelayError::InvalidTransition { from, to } => {
                assert_eq!(from, "idle");
                assert_eq!(to, "done");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(m.state(), StreamState::Idle);
    }

    #[test]
    fn tool_use_cannot_finish_directly() {
        let mut m = StreamStateMachine::new();
        m.begin().unwrap();
        m.tool_call_start("a", "search").unwrap();
        assert!(m.finish().is_err());
        assert!(m.text("oops").is_err());
        m.abandon_tool_call().unwrap();
        m.finish().unwrap();
    }

    #[test]
    fn reset_only_from_done() {
        let mut m = StreamStateMachine::new();
        m.begin().unwrap();
        assert!(m.reset().is_err());
    }

    #[test]
    fn unregistered_listener_stops_receiving() {
        let mut m = StreamStateMachine::new();
        let (events, handle) = recorder(&m);
        m.begin().unwrap();
        handle.unregister();
        m.text("ignored").unwrap();
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_break_the_machine() {
        let mut m = StreamStateMachine::new();
        let _bad = m.on_event(|_| panic!("listener bug"));
        let (events, _h) = recorder(&m);
        m.begin().unwrap();
        m.finish().unwrap();
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn table_is_exhaustive() {
        use StreamState::*;
        let all = [Idle, Streaming, ToolUse, Executing, Done];
        let legal: usize = all
            .iter()
            .map(|a| all.iter().filter(|b| a.can_transition_to(**b)).count())
            .sum();
        assert_eq!(legal, 7);
    }
}
