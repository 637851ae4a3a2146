use super::{ChatRequest, LlmBackend};
use crate::stream::{EventStream, StreamEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use relay_core::{RelayError, RelayResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Items of one scripted stream; an `Err` item fails the stream mid-way.
pub type ScriptedStream = Vec<RelayResult<StreamEvent>>;

type ReplyFn = dyn Fn(usize, &ChatRequest<'_>) -> RelayResult<ScriptedStream> + Send + Sync;

/// Offline backend that replays scripted streams.
///
/// Useful for embedding tests and for replaying recorded provider sessions.
/// Each call to [`LlmBackend::stream`] asks the reply function for the
/// events of that call (numbered from 0).
pub struct ScriptedBackend {
    reply: Box<ReplyFn>,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// Replays `replies` in order; an extra call fails with an agent error.
    pub fn new(replies: Vec<RelayResult<Vec<StreamEvent>>>) -> Self {
        let queue = Mutex::new(replies.into_iter().collect::<VecDeque<_>>());
        Self::from_fn(move |_, _| match queue.lock().pop_front() {
            Some(reply) => reply.map(|events| events.into_iter().map(Ok).collect()),
            None => Err(RelayError::Agent("scripted backend has no reply left".into())),
        })
    }

    /// Builds every reply with `reply(call_index, request)`.
    pub fn from_fn<F>(reply: F) -> Self
    where
        F: Fn(usize, &ChatRequest<'_>) -> RelayResult<ScriptedStream> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    /// Number of round trips requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Model ids requested so far, in call order.
    pub fn requested_models(&self) -> Vec<String> {
        self.models.lock().clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn stream(&self, request: ChatRequest<'_>) -> RelayResult<EventStream> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().push(request.model.to_string());
        let items = (self.reply)(index, &request)?;
        Ok(futures_util::stream::iter(items).boxed())
    }
}

/// Events of a plain text answer.
pub fn text_turn(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta {
            text: text.to_string(),
        },
        StreamEvent::Done {
            stop_reason: Some("end_turn".into()),
        },
    ]
}

/// Events of a single tool call whose arguments arrive in two fragments.
pub fn tool_turn(id: &str, name: &str, arguments: &str) -> Vec<StreamEvent> {
    let split = arguments.len() / 2;
    let (head, tail) = if arguments.is_char_boundary(split) {
        arguments.split_at(split)
    } else {
        (arguments, "")
    };
    vec![
        StreamEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        },
        StreamEvent::ToolCallDelta {
            id: id.to_string(),
            arguments_delta: head.to_string(),
        },
        StreamEvent::ToolCallDelta {
            id: id.to_string(),
            arguments_delta: tail.to_string(),
        },
        StreamEvent::ToolCallEnd { id: id.to_string() },
        StreamEvent::Done {
            stop_reason: Some("tool_use".into()),
        },
    ]
}
