use crate::assembler::ToolCallAssembler;
use crate::backends::{ChatRequest, LlmBackend};
use crate::config::RunnerConfig;
use crate::executor::ToolExecutor;
use crate::state_machine::StreamStateMachine;
use crate::stream::StreamEvent;
use futures_util::StreamExt;
use relay_core::{
    await_or_cancel, call_guarded, CancelAware, CancellationToken, Message, RelayError,
    RelayResult, Role, ThresholdWarning, TokenCounter, TokenUsage, ToolCall, ToolDescriptor,
    ToolResult,
};
use relay_resilience::{retry_with_backoff, DefaultClassifier, FailureClassifier, LaneRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Input for one [`TurnRunner::execute`] call.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    /// Lane key; executions sharing it are admitted per the lane limits.
    pub session_key: String,
    /// Provider-native model id.
    pub model: String,
    /// System prompt handed to the backend.
    pub system_prompt: Option<String>,
    /// Conversation so far, oldest first.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    pub tools: Vec<ToolDescriptor>,
    /// Overrides [`RunnerConfig::max_turns`] for this call.
    pub max_turns: Option<u32>,
    /// Caller's cancellation signal.
    pub cancel: CancellationToken,
}

impl ExecuteParams {
    /// Creates params with no tools, no system prompt and a fresh signal.
    pub fn new(
        session_key: impl Into<String>,
        model: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            model: model.into(),
            system_prompt: None,
            messages,
            tools: Vec::new(),
            max_turns: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the tool list.
    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    /// Overrides the turn budget.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Uses `cancel` as the cancellation signal.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The model stopped requesting tools.
    Completed,
    /// The turn budget ran out.
    MaxTurns,
    /// The caller cancelled.
    Aborted,
    /// A round trip failed after retries.
    Error,
}

/// Outcome of [`TurnRunner::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// How the execution ended.
    pub status: ExecutionStatus,
    /// Full history: the input messages plus everything appended.
    pub messages: Vec<Message>,
    /// Usage folded from every successful round trip.
    pub usage: TokenUsage,
    /// Turns started.
    pub turns: u32,
    /// Wall time, admission wait included.
    pub duration_ms: u64,
    /// Error text when `status` is [`ExecutionStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Text of the last assistant message, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

/// Live events delivered to an execution listener.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Assistant text fragment.
    TextDelta {
        /// The fragment.
        text: String,
    },
    /// The model opened a tool call.
    ToolCallStart {
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// A tool call's arguments are complete.
    ToolCallEnd {
        /// The completed call.
        call: ToolCall,
    },
    /// Usage reported by the provider, as it arrives.
    Usage {
        /// Earlier turns plus the current round trip so far.
        usage: TokenUsage,
    },
    /// A usage threshold was crossed.
    UsageWarning {
        /// Threshold details.
        warning: ThresholdWarning,
    },
    /// Terminal event carrying the same result `execute` returns.
    Done {
        /// The final result.
        result: ExecutionResult,
    },
}

/// Callback receiving [`RunEvent`]s.
pub type RunListener = Arc<dyn Fn(&RunEvent) + Send + Sync>;

struct EventSink(Option<RunListener>);

impl EventSink {
    fn is_active(&self) -> bool {
        self.0.is_some()
    }

    fn emit(&self, event: RunEvent) {
        if let Some(listener) = &self.0 {
            call_guarded(listener.as_ref(), &event);
        }
    }
}

/// Per-execution values shared by every turn.
struct TurnContext<'a> {
    session: &'a str,
    model: &'a str,
    system_prompt: Option<&'a str>,
    tools: &'a [ToolDescriptor],
    cancel: &'a CancellationToken,
    sink: &'a EventSink,
    max_turns: u32,
}

#[derive(Debug, Default)]
struct RoundTrip {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

/// The turn runner: orchestrates the agentic loop.
/// Prompt → LLM → ToolCall → Execute → Backfill → Repeat.
pub struct TurnRunner {
    config: RunnerConfig,
    backend: Arc<dyn LlmBackend>,
    executor: Arc<dyn ToolExecutor>,
    lanes: LaneRegistry,
    classifier: Arc<dyn FailureClassifier>,
}

impl TurnRunner {
    /// Creates a runner using [`DefaultClassifier`] for retry decisions.
    pub fn new(
        config: RunnerConfig,
        backend: Arc<dyn LlmBackend>,
        executor: Arc<dyn ToolExecutor>,
        lanes: LaneRegistry,
    ) -> Self {
        Self {
            config,
            backend,
            executor,
            lanes,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    /// Replaces the failure classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// The runner's configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The lane registry gating admission.
    pub fn lanes(&self) -> &LaneRegistry {
        &self.lanes
    }

    fn is_retryable(&self, err: &RelayError) -> bool {
        self.classifier
            .classify(err)
            .is_some_and(|reason| self.config.retry_on.contains(&reason))
    }

    /// Runs turns until the model stops calling tools, the turn budget runs
    /// out, or the caller cancels.
    ///
    /// An invalid [`RunnerConfig`] and lane admission failures (queue full,
    /// wait timeout, cleared) are returned as `Err`. Everything after admission ends in an
    /// [`ExecutionResult`]; a round trip that fails after retries yields
    /// [`ExecutionStatus::Error`] with the transcript built so far.
    pub async fn execute(
        &self,
        params: ExecuteParams,
        listener: Option<RunListener>,
    ) -> RelayResult<ExecutionResult> {
        self.config.validate()?;
        let started = Instant::now();
        let sink = EventSink(listener);
        let ExecuteParams {
            session_key,
            model,
            system_prompt,
            mut messages,
            tools,
            max_turns,
            cancel,
        } = params;
        let max_turns = max_turns.unwrap_or(self.config.max_turns);
        if max_turns == 0 {
            return Err(RelayError::Config("max_turns must be at least 1".into()));
        }
        let mut counter =
            TokenCounter::with_thresholds(self.config.context_window, &self.config.usage_thresholds);

        let admitted = await_or_cancel(&cancel, self.lanes.acquire(&session_key)).await;
        let (status, turns, error) = match admitted {
            CancelAware::Cancelled => {
                info!(session = %session_key, "Execution aborted before admission");
                (ExecutionStatus::Aborted, 0, None)
            }
            CancelAware::Value(handle) => {
                let mut lane = handle?;
                info!(session = %session_key, model = %model, max_turns, "Starting turn loop");
                let ctx = TurnContext {
                    session: &session_key,
                    model: &model,
                    system_prompt: system_prompt.as_deref(),
                    tools: &tools,
                    cancel: &cancel,
                    sink: &sink,
                    max_turns,
                };
                let outcome = self.run_turns(&ctx, &mut messages, &mut counter).await;
                lane.release();
                outcome
            }
        };

        let result = ExecutionResult {
            status,
            messages,
            usage: counter.usage(),
            turns,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };
        info!(
            session = %session_key,
            status = ?result.status,
            turns = result.turns,
            duration_ms = result.duration_ms,
            "Turn loop finished"
        );
        if sink.is_active() {
            sink.emit(RunEvent::Done {
                result: result.clone(),
            });
        }
        Ok(result)
    }

    async fn run_turns(
        &self,
        ctx: &TurnContext<'_>,
        messages: &mut Vec<Message>,
        counter: &mut TokenCounter,
    ) -> (ExecutionStatus, u32, Option<String>) {
        let mut turns = 0u32;
        loop {
            if ctx.cancel.is_cancelled() {
                info!(session = ctx.session, turns, "Execution cancelled");
                return (ExecutionStatus::Aborted, turns, None);
            }
            if turns >= ctx.max_turns {
                warn!(session = ctx.session, max_turns = ctx.max_turns, "Turn loop reached max turns");
                return (ExecutionStatus::MaxTurns, turns, None);
            }
            turns += 1;
            debug!(session = ctx.session, turn = turns, "Turn started");

            let request = ChatRequest {
                model: ctx.model,
                system_prompt: ctx.system_prompt,
                messages: messages.as_slice(),
                tools: ctx.tools,
            };
            let before = counter.usage();
            let outcome = retry_with_backoff(
                &self.config.retry,
                ctx.cancel,
                |e| self.is_retryable(e),
                |attempt| self.round_trip(request, attempt, before, ctx),
            )
            .await;

            let round = match outcome {
                Ok(round) => round,
                Err(e) if e.is_cancelled() => {
                    info!(session = ctx.session, turn = turns, "Execution cancelled mid-turn");
                    return (ExecutionStatus::Aborted, turns, None);
                }
                Err(e) => {
                    warn!(session = ctx.session, turn = turns, error = %e, "Turn failed");
                    return (ExecutionStatus::Error, turns, Some(e.to_string()));
                }
            };

            counter.add(&round.usage);
            counter.check_thresholds(|warning| {
                ctx.sink.emit(RunEvent::UsageWarning { warning: *warning });
            });

            let RoundTrip {
                text,
                tool_calls,
                stop_reason,
                ..
            } = round;

            if tool_calls.is_empty() {
                messages.push(Message::assistant(text));
                debug!(session = ctx.session, turn = turns, stop_reason = ?stop_reason, "Model finished");
                return (ExecutionStatus::Completed, turns, None);
            }

            messages.push(Message::assistant_with_tools(text, tool_calls.clone()));
            let results = self.dispatch_tools(&tool_calls, ctx).await;
            messages.push(Message::tool_results(results));
        }
    }

    /// Streams one request through the state machine and assembler.
    ///
    /// Usage events are forwarded live on top of `before`, the usage of
    /// earlier turns.
    async fn round_trip(
        &self,
        request: ChatRequest<'_>,
        attempt: u32,
        before: TokenUsage,
        ctx: &TurnContext<'_>,
    ) -> RelayResult<RoundTrip> {
        let mut machine = StreamStateMachine::new();
        let mut assembler = ToolCallAssembler::new();
        let mut round = RoundTrip::default();

        machine.begin()?;
        let mut stream = match await_or_cancel(ctx.cancel, self.backend.stream(request)).await {
            CancelAware::Cancelled => return Err(RelayError::Cancelled),
            CancelAware::Value(stream) => stream?,
        };

        loop {
            let event = match await_or_cancel(ctx.cancel, stream.next()).await {
                CancelAware::Cancelled => return Err(RelayError::Cancelled),
                CancelAware::Value(None) => break,
                CancelAware::Value(Some(event)) => event?,
            };

            match event {
                StreamEvent::TextDelta { text } => {
                    machine.text(&text)?;
                    round.text.push_str(&text);
                    ctx.sink.emit(RunEvent::TextDelta { text });
                }
                StreamEvent::ToolCallStart { id, name } => {
                    if let Some(open) = assembler.open_id() {
                        warn!(superseded = open, next = %id, "Tool call started before the previous one closed");
                        machine.abandon_tool_call()?;
                    }
                    machine.tool_call_start(&id, &name)?;
                    ctx.sink.emit(RunEvent::ToolCallStart {
                        id: id.clone(),
                        name: name.clone(),
                    });
                    assembler.start(id, name);
                }
                StreamEvent::ToolCallDelta {
                    id,
                    arguments_delta,
                } => {
                    if !assembler.push_fragment(&arguments_delta) {
                        debug!(call_id = %id, "Argument fragment without an open tool call");
                    }
                }
                StreamEvent::ToolCallEnd { id } => match assembler.finish() {
                    Some(call) => {
                        machine.tool_call_end(&call)?;
                        ctx.sink.emit(RunEvent::ToolCallEnd { call: call.clone() });
                        round.tool_calls.push(call);
                    }
                    None => debug!(call_id = %id, "Close event without an open tool call"),
                },
                StreamEvent::Usage { usage } => {
                    round.usage.accumulate(&usage);
                    let mut running = before;
                    running.accumulate(&round.usage);
                    ctx.sink.emit(RunEvent::Usage { usage: running });
                }
                StreamEvent::Done { stop_reason } => {
                    round.stop_reason = stop_reason;
                    break;
                }
            }
        }

        if let Some(id) = assembler.abandon() {
            warn!(call_id = %id, "Stream ended inside a tool call, discarding it");
            machine.abandon_tool_call()?;
        }
        machine.finish()?;
        debug!(
            attempt,
            tool_calls = round.tool_calls.len(),
            output_tokens = round.usage.output_tokens,
            "Round trip complete"
        );
        Ok(round)
    }

    /// Runs every call concurrently and returns one result per call, in order.
    async fn dispatch_tools(&self, calls: &[ToolCall], ctx: &TurnContext<'_>) -> Vec<ToolResult> {
        for call in calls {
            info!(
                session = ctx.session,
                tool = %call.name,
                call_id = %call.id,
                "Executing tool call"
            );
        }
        let mut produced = self.executor.execute_batch(calls, ctx.cancel).await;

        let results: Vec<ToolResult> = calls
            .iter()
            .map(|call| match produced.iter().position(|r| r.tool_call_id == call.id) {
                Some(idx) => produced.swap_remove(idx),
                None => {
                    warn!(tool = %call.name, call_id = %call.id, "Tool executor returned no result");
                    ToolResult::error(
                        call.id.as_str(),
                        format!("tool '{}' produced no result", call.name),
                    )
                }
            })
            .collect();

        if !produced.is_empty() {
            warn!(extra = produced.len(), "Dropping results for unknown tool calls");
        }
        results
    }
}
