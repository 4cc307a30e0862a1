//! One conversational turn: model output in, gated tool calls, wire events out.
//!
//! Tool calls are handled as soon as the inference stream yields them, so a
//! suspended call blocks the remainder of the stream until it is decided.
//! Every loop event goes through the [`EventTranslator`] before it reaches the
//! client, which keeps the ordering rules in one place.

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequired, GateDecision, GateError};
use crate::emitter::{EmitError, StreamEmitter};
use crate::session::Session;
use crate::state::{Scope, SessionState, counter_value, string_list};
use crate::translator::{EventTranslator, LoopEvent, ToolResultPayload, TranslateError};
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tg_llm::{
    ChatMessage, InferenceEvent, InferenceProvider, LlmError, Role, ToolInvocationRequest, Usage,
};
use tg_tools::ToolRegistry;
use thiserror::Error;

/// Session-scoped count of turns started in this conversation.
pub const TURN_COUNT_KEY: &str = "turn_count";
/// Session- or user-scoped list of tool names approved without asking.
pub const AUTO_APPROVE_KEY: &str = "auto_approve";

const LOOP_LIMIT_TEXT: &str = "Tool loop limit reached.";
const AUTO_APPROVE_NOTE: &str = "auto-approved by policy";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("client disconnected mid-turn")]
    Disconnected,
    #[error("inference failed: {0}")]
    Inference(#[from] LlmError),
    #[error("event serialization failed: {0}")]
    Serialization(String),
    #[error("event ordering fault: {0}")]
    Translation(#[from] TranslateError),
    #[error(transparent)]
    Gate(#[from] GateError),
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub system_prompt: String,
    pub tool_loops_max: usize,
    pub approval_timeout: Duration,
    pub max_tool_chars: usize,
    pub auto_approve: BTreeSet<String>,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a careful assistant. Use tools when they help.".to_string(),
            tool_loops_max: 4,
            approval_timeout: Duration::from_secs(30),
            max_tool_chars: 16_000,
            auto_approve: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnSummary {
    /// Text of the final model call.
    pub text: String,
    pub tool_calls: usize,
    pub model_calls: usize,
    pub usage: Usage,
    pub loop_limit_hit: bool,
}

/// Translator plus emitter for one client stream.
struct Outbound {
    translator: EventTranslator,
    emitter: StreamEmitter,
}

impl Outbound {
    async fn send(&mut self, event: LoopEvent) -> Result<(), TurnError> {
        let Some(wire) = self.translator.translate(event)? else {
            return Ok(());
        };
        match self.emitter.emit(&wire).await {
            Ok(()) => Ok(()),
            Err(EmitError::Disconnected) => Err(TurnError::Disconnected),
            Err(e @ EmitError::Serialization { .. }) => Err(TurnError::Serialization(e.to_string())),
            Err(EmitError::Closed) => Err(TurnError::Translation(TranslateError::StreamEnded)),
        }
    }

    async fn flush_state(&mut self, state: &mut SessionState) -> Result<(), TurnError> {
        for change in state.take_changes() {
            tracing::debug!(key = %change.scope.qualify(&change.key), "state update");
            self.send(LoopEvent::StateChanged(change)).await?;
        }
        Ok(())
    }

    /// Close the stream after a fault. Failures here are logged and dropped.
    async fn finish_best_effort(&mut self) {
        if self.translator.is_ended() {
            return;
        }
        if let Err(e) = self.send(LoopEvent::TurnEnded).await {
            tracing::warn!(error = %e, "could not deliver StreamEnd after fault");
        }
    }
}

/// Model reply being assembled from one inference stream.
#[derive(Default)]
struct ModelReply {
    content: String,
    handled: Vec<(ToolInvocationRequest, ToolResultPayload)>,
}

pub struct Orchestrator {
    settings: TurnSettings,
    provider: Arc<dyn InferenceProvider>,
    tools: Arc<ToolRegistry>,
}

impl Orchestrator {
    pub fn new(
        settings: TurnSettings,
        provider: Arc<dyn InferenceProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            settings,
            provider,
            tools,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Run one turn and stream it to `emitter`.
    ///
    /// A disconnect stops the turn without further events; state already
    /// written stays. Any other fault is logged and the stream is closed with
    /// a best-effort `StreamEnd`.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(session_id = %session.id, user_id = %session.user_id, provider = %self.provider.name())
    )]
    pub async fn run_turn(
        &self,
        session: &mut Session,
        gate: &ApprovalGate,
        user_message: &str,
        emitter: StreamEmitter,
    ) -> Result<TurnSummary, TurnError> {
        let mut out = Outbound {
            translator: EventTranslator::new(),
            emitter,
        };
        let started = Instant::now();
        let result = self.drive(session, gate, user_message, &mut out).await;
        session.last_active = chrono::Utc::now();

        let result = match result {
            Ok(summary) => match out.flush_state(&mut session.state).await {
                Ok(()) => out.send(LoopEvent::TurnEnded).await.map(|()| summary),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        session.state.end_cycle();

        match &result {
            Ok(summary) => tracing::info!(
                latency_ms = started.elapsed().as_millis() as u64,
                model_calls = summary.model_calls,
                response_len = summary.text.len(),
                loop_limit_hit = summary.loop_limit_hit,
                tool_calls = summary.tool_calls,
                prompt_tokens = summary.usage.prompt_tokens,
                completion_tokens = summary.usage.completion_tokens,
                events = out.emitter.emitted(),
                "turn completed"
            ),
            Err(TurnError::Disconnected) => tracing::warn!(
                open_invocations = ?out.translator.open_invocations(),
                events = out.emitter.emitted(),
                "client disconnected; turn aborted"
            ),
            Err(e) => {
                tracing::error!(error = %e, "turn failed; closing stream");
                out.finish_best_effort().await;
            }
        }
        result
    }

    async fn drive(
        &self,
        session: &mut Session,
        gate: &ApprovalGate,
        user_message: &str,
        out: &mut Outbound,
    ) -> Result<TurnSummary, TurnError> {
        session.state.begin_cycle();
        let turn = counter_value(session.state.get(Scope::Session, TURN_COUNT_KEY)) + 1;
        session
            .state
            .set(Scope::Session, TURN_COUNT_KEY, serde_json::json!(turn));
        out.flush_state(&mut session.state).await?;

        session.history.push(ChatMessage::user(user_message));
        let definitions = self.tools.definitions();
        let mut summary = TurnSummary::default();

        loop {
            summary.model_calls += 1;
            if summary.model_calls > self.settings.tool_loops_max {
                tracing::error!(
                    tool_loops_max = self.settings.tool_loops_max,
                    "tool loop limit reached"
                );
                summary.model_calls -= 1;
                summary.loop_limit_hit = true;
                summary.text = LOOP_LIMIT_TEXT.to_string();
                out.send(LoopEvent::ModelText(LOOP_LIMIT_TEXT.to_string()))
                    .await?;
                session
                    .history
                    .push(ChatMessage::assistant(LOOP_LIMIT_TEXT, vec![]));
                return Ok(summary);
            }

            let messages = self.build_prompt(&session.history);
            tracing::debug!(
                model_call = summary.model_calls,
                prompt_messages = messages.len(),
                tools = definitions.len(),
                "inference started"
            );
            let stream = self.provider.stream_turn(&messages, &definitions).await?;

            let mut reply = ModelReply::default();
            let streamed = self
                .consume_stream(stream, session, gate, out, &mut reply, &mut summary)
                .await;

            let called_tools = !reply.handled.is_empty();
            summary.tool_calls += reply.handled.len();
            summary.text = reply.content.clone();
            record_exchange(session, reply);
            streamed?;

            if !called_tools {
                return Ok(summary);
            }
        }
    }

    async fn consume_stream(
        &self,
        mut stream: tg_llm::InferenceStream,
        session: &mut Session,
        gate: &ApprovalGate,
        out: &mut Outbound,
        reply: &mut ModelReply,
        summary: &mut TurnSummary,
    ) -> Result<(), TurnError> {
        while let Some(event) = stream.next().await {
            match event? {
                InferenceEvent::TextDelta(text) => {
                    reply.content.push_str(&text);
                    out.send(LoopEvent::ModelText(text)).await?;
                }
                InferenceEvent::ToolCall(request) => {
                    let payload = self.handle_tool_call(&request, session, gate, out).await?;
                    reply.handled.push((request, payload));
                }
                InferenceEvent::End { usage } => {
                    session.add_usage(usage);
                    summary.usage.prompt_tokens += usage.prompt_tokens;
                    summary.usage.completion_tokens += usage.completion_tokens;
                    break;
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(tool_call_id = %request.invocation_id, tool_name = %request.tool_name)
    )]
    async fn handle_tool_call(
        &self,
        request: &ToolInvocationRequest,
        session: &mut Session,
        gate: &ApprovalGate,
        out: &mut Outbound,
    ) -> Result<ToolResultPayload, TurnError> {
        let invocation_id = request.invocation_id.clone();
        match gate.evaluate(request, &mut session.state) {
            GateDecision::Proceed => {
                out.send(LoopEvent::ToolAllowed(request.clone())).await?;
            }
            GateDecision::Suspend(required) => {
                let decision = match self.await_decision(required, session, gate, out).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        // Never leave the invocation pending without a waiter.
                        let note = match e {
                            TurnError::Disconnected => "client disconnected",
                            _ => "turn aborted",
                        };
                        if let Err(stale) = gate.resolve(ApprovalDecision::deny(
                            invocation_id.clone(),
                            Some(note.to_string()),
                        )) {
                            tracing::debug!(error = %stale, "invocation already decided before abort");
                        }
                        return Err(e);
                    }
                };
                let approved = decision.approved;
                let note = decision.responder_note.clone();
                out.send(LoopEvent::ApprovalResolved {
                    request: request.clone(),
                    decision,
                })
                .await?;
                if !approved {
                    return Ok(ToolResultPayload::rejected(note));
                }
            }
        }

        let started = Instant::now();
        let outcome = self
            .tools
            .execute(&request.tool_name, request.arguments_value())
            .await
            .map_err(|e| e.to_string());
        gate.record_executed(&invocation_id);
        match &outcome {
            Ok(output) => tracing::info!(
                latency_ms = started.elapsed().as_millis() as u64,
                output_len = output.to_string().len(),
                "tool call executed"
            ),
            Err(error) => tracing::warn!(
                latency_ms = started.elapsed().as_millis() as u64,
                %error,
                "tool call failed"
            ),
        }
        out.send(LoopEvent::ToolCompleted {
            invocation_id,
            outcome: outcome.clone(),
        })
        .await?;
        Ok(match outcome {
            Ok(output) => ToolResultPayload::Success { output },
            Err(error) => ToolResultPayload::Error { error },
        })
    }

    /// Announce a suspended call and wait for its decision. The caller
    /// denies the invocation if this returns an error.
    async fn await_decision(
        &self,
        required: ApprovalRequired,
        session: &mut Session,
        gate: &ApprovalGate,
        out: &mut Outbound,
    ) -> Result<ApprovalDecision, TurnError> {
        let invocation_id = required.invocation_id.clone();
        let tool_name = required.tool_name.clone();
        out.flush_state(&mut session.state).await?;
        out.send(LoopEvent::ApprovalRequested(required)).await?;

        if self.auto_approves(&tool_name, &session.state)
            && gate
                .resolve(ApprovalDecision::approve(
                    invocation_id.clone(),
                    Some(AUTO_APPROVE_NOTE.to_string()),
                ))
                .is_ok()
        {
            tracing::info!("tool call auto-approved");
        }

        let waited = Instant::now();
        let decision = tokio::select! {
            decision = gate.wait_for_decision(&invocation_id, self.settings.approval_timeout) => decision?,
            _ = out.emitter.disconnected() => return Err(TurnError::Disconnected),
        };
        tracing::info!(
            approved = decision.approved,
            wait_ms = waited.elapsed().as_millis() as u64,
            "approval decided"
        );
        Ok(decision)
    }

    fn auto_approves(&self, tool_name: &str, state: &SessionState) -> bool {
        if self.settings.auto_approve.contains(tool_name) {
            return true;
        }
        [Scope::Session, Scope::User].into_iter().any(|scope| {
            string_list(state.get(scope, AUTO_APPROVE_KEY))
                .iter()
                .any(|name| name == tool_name)
        })
    }

    fn build_prompt(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.settings.system_prompt.clone()));
        messages.extend(history.iter().map(|m| self.normalize_history_message(m)));
        messages
    }

    fn normalize_history_message(&self, msg: &ChatMessage) -> ChatMessage {
        let max_chars = self.settings.max_tool_chars;
        if msg.role != Role::Tool || msg.content.chars().count() <= max_chars {
            return msg.clone();
        }
        let truncated: String = msg.content.chars().take(max_chars).collect();
        let dropped_chars = msg.content.chars().count().saturating_sub(max_chars);
        let mut out = msg.clone();
        out.content =
            format!("{truncated}\n...[tool output truncated: dropped {dropped_chars} chars]");
        tracing::debug!(max_tool_chars = max_chars, dropped_chars, "tool message truncated");
        out
    }
}

/// Append the assistant message and one tool message per handled call.
fn record_exchange(session: &mut Session, reply: ModelReply) {
    if reply.content.is_empty() && reply.handled.is_empty() {
        return;
    }
    let tool_calls = reply
        .handled
        .iter()
        .map(|(request, _)| request.to_tool_call())
        .collect();
    session
        .history
        .push(ChatMessage::assistant(reply.content, tool_calls));
    for (request, payload) in reply.handled {
        session.history.push(ChatMessage::tool_result(
            request.invocation_id,
            payload.to_model_content(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter;
    use crate::state::ScopeEntries;
    use crate::translator::WireEvent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use tg_llm::ScriptedProvider;
    use tg_tools::{Tool, ToolClassifier, ToolSpec, Workspace};
    use tokio::sync::{Notify, mpsc};

    fn decode(frame: &Bytes) -> WireEvent {
        let text = std::str::from_utf8(frame).expect("utf8 frame");
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .expect("data line");
        serde_json::from_str(data).expect("wire event")
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<WireEvent> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(&frame));
        }
        out
    }

    async fn next_event(rx: &mut mpsc::Receiver<Bytes>) -> WireEvent {
        decode(&rx.recv().await.expect("stream open"))
    }

    fn kinds(events: &[WireEvent]) -> Vec<&'static str> {
        events.iter().map(WireEvent::kind).collect()
    }

    fn workspace_registry(root: &std::path::Path) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in Workspace::new(root).expect("workspace").tools() {
            registry.register(tool).expect("register");
        }
        Arc::new(registry)
    }

    fn gate() -> Arc<ApprovalGate> {
        Arc::new(ApprovalGate::new(Arc::new(ToolClassifier::default())))
    }

    fn session() -> Session {
        Session::new("u-1", ScopeEntries::new())
    }

    fn tool_messages(history: &[ChatMessage]) -> Vec<String> {
        history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .collect()
    }

    #[tokio::test]
    async fn safe_tool_runs_without_approval() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "remember the milk").unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn("c1", "read_file", json!({"path": "notes.md"})),
            ScriptedProvider::text_turn("All done"),
        ]);
        let orchestrator = Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        );
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        let summary = orchestrator
            .run_turn(&mut session, &gate, "what do my notes say?", emitter)
            .await
            .expect("turn");

        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![
                "StateUpdate",
                "ToolCallStart",
                "ToolCallResult",
                "TextDelta",
                "TextDelta",
                "StreamEnd"
            ]
        );
        let WireEvent::ToolCallResult { result, .. } = &events[2] else {
            panic!("expected result");
        };
        assert_eq!(
            result,
            &ToolResultPayload::Success {
                output: json!({"path": "notes.md", "content": "remember the milk"})
            }
        );
        assert_eq!(summary.text, "All done");
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.model_calls, 2);
        assert!(session.state.get(Scope::Temp, "tool_count").is_none());
        assert_eq!(
            session.state.get(Scope::Session, TURN_COUNT_KEY),
            Some(&json!(1))
        );
        assert_eq!(
            gate.status("c1"),
            Some(crate::approval::InvocationStatus::Executed)
        );
    }

    #[tokio::test]
    async fn gated_tool_waits_for_approval() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(
                "c2",
                "write_file",
                json!({"path": "out.txt", "content": "hi"}),
            ),
            ScriptedProvider::text_turn("Written."),
        ]);
        let orchestrator = Arc::new(Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        ));
        let gate = gate();
        let (emitter, mut rx) = emitter::channel(64);

        let run = {
            let orchestrator = orchestrator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut session = session();
                let result = orchestrator
                    .run_turn(&mut session, &gate, "save hi", emitter)
                    .await;
                (session, result)
            })
        };

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut rx).await;
            let is_request = matches!(event, WireEvent::ApprovalRequired { .. });
            seen.push(event);
            if is_request {
                break;
            }
        }
        assert!(!tmp.path().join("out.txt").exists());
        assert_eq!(gate.pending().len(), 1);
        gate.resolve(ApprovalDecision::approve("c2", None))
            .expect("approve");
        assert!(matches!(
            gate.resolve(ApprovalDecision::deny("c2", None)),
            Err(GateError::StaleDecision { .. })
        ));

        let (session, result) = run.await.expect("join");
        result.expect("turn");
        seen.extend(drain(&mut rx));

        assert_eq!(
            kinds(&seen),
            vec![
                "StateUpdate",
                "StateUpdate",
                "ApprovalRequired",
                "ToolCallStart",
                "ToolCallResult",
                "TextDelta",
                "StreamEnd"
            ]
        );
        assert_eq!(
            seen[1],
            WireEvent::StateUpdate {
                scope: Scope::Temp,
                key: "tool_count".to_string(),
                value: json!(1)
            }
        );
        let WireEvent::ApprovalRequired { arguments, .. } = &seen[2] else {
            panic!("expected approval request");
        };
        assert_eq!(arguments["path"], json!("out.txt"));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("out.txt")).unwrap(),
            "hi"
        );
        assert_eq!(tool_messages(&session.history).len(), 1);
    }

    #[tokio::test]
    async fn denied_tool_never_runs_and_model_is_told() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn("c3", "write_file", json!({"path": "x.txt", "content": "x"})),
            ScriptedProvider::text_turn("Understood."),
        ]));
        let orchestrator = Arc::new(Orchestrator::new(
            TurnSettings::default(),
            provider.clone(),
            workspace_registry(tmp.path()),
        ));
        let gate = gate();
        let (emitter, mut rx) = emitter::channel(64);

        let run = {
            let orchestrator = orchestrator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut session = session();
                let result = orchestrator
                    .run_turn(&mut session, &gate, "write x", emitter)
                    .await;
                (session, result)
            })
        };
        while !matches!(next_event(&mut rx).await, WireEvent::ApprovalRequired { .. }) {}
        gate.resolve(ApprovalDecision::deny("c3", Some("too risky".into())))
            .expect("deny");

        let (session, result) = run.await.expect("join");
        result.expect("turn");
        let rest = drain(&mut rx);
        assert_eq!(kinds(&rest), vec!["ToolCallResult", "TextDelta", "StreamEnd"]);
        let WireEvent::ToolCallResult { result, .. } = &rest[0] else {
            panic!("expected result");
        };
        assert!(matches!(
            result,
            ToolResultPayload::Rejected { note: Some(note), .. } if note == "too risky"
        ));
        assert!(!tmp.path().join("x.txt").exists());

        let second_call = &provider.seen_requests()[1];
        let tool_message = second_call
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool message");
        assert!(tool_message.content.contains("rejected"));
        assert_eq!(tool_messages(&session.history).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn approval_timeout_denies() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_turn(
            "c4",
            "refund_order",
            json!({"order": 7}),
        )]);
        let orchestrator = Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        );
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        orchestrator
            .run_turn(&mut session, &gate, "refund order 7", emitter)
            .await
            .expect("turn");

        let events = drain(&mut rx);
        let rejected = events.iter().find_map(|e| match e {
            WireEvent::ToolCallResult {
                result: ToolResultPayload::Rejected { note, .. },
                ..
            } => note.clone(),
            _ => None,
        });
        assert!(rejected.is_some_and(|n| n.contains("timed out")));
        assert!(!kinds(&events).contains(&"ToolCallStart"));
        assert_eq!(events.last(), Some(&WireEvent::StreamEnd {}));
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn auto_approve_policy_skips_the_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn("c5", "write_file", json!({"path": "a.txt", "content": "a"})),
        ]);
        let settings = TurnSettings {
            auto_approve: BTreeSet::from(["write_file".to_string()]),
            ..TurnSettings::default()
        };
        let orchestrator =
            Orchestrator::new(settings, Arc::new(provider), workspace_registry(tmp.path()));
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        orchestrator
            .run_turn(&mut session, &gate, "write a", emitter)
            .await
            .expect("turn");

        let events = drain(&mut rx);
        let kinds = kinds(&events);
        let approval = kinds.iter().position(|k| *k == "ApprovalRequired");
        let start = kinds.iter().position(|k| *k == "ToolCallStart");
        assert!(approval.is_some() && start.is_some() && approval < start);
        assert!(tmp.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn session_scoped_auto_approve_list_is_honoured() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn("c6", "write_file", json!({"path": "b.txt", "content": "b"})),
        ]);
        let orchestrator = Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        );
        let gate = gate();
        let mut session = session();
        session
            .state
            .set(Scope::Session, AUTO_APPROVE_KEY, json!(["write_file"]));
        session.state.take_changes();
        let (emitter, _rx) = emitter::channel(64);

        orchestrator
            .run_turn(&mut session, &gate, "write b", emitter)
            .await
            .expect("turn");
        assert!(tmp.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn loop_limit_stops_runaway_tool_use() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let provider = ScriptedProvider::new(
            (1..=3)
                .map(|i| {
                    ScriptedProvider::tool_turn(&format!("c{i}"), "read_file", json!({"path": "a.txt"}))
                })
                .collect(),
        );
        let settings = TurnSettings {
            tool_loops_max: 2,
            ..TurnSettings::default()
        };
        let orchestrator =
            Orchestrator::new(settings, Arc::new(provider), workspace_registry(tmp.path()));
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        let summary = orchestrator
            .run_turn(&mut session, &gate, "loop", emitter)
            .await
            .expect("turn");
        assert!(summary.loop_limit_hit);
        assert_eq!(summary.model_calls, 2);
        let events = drain(&mut rx);
        assert!(events.contains(&WireEvent::TextDelta {
            content: LOOP_LIMIT_TEXT.to_string()
        }));
    }

    #[tokio::test]
    async fn tool_errors_are_reported_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn("c7", "read_file", json!({"path": "missing.txt"})),
            ScriptedProvider::text_turn("It is missing."),
        ]);
        let orchestrator = Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        );
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        orchestrator
            .run_turn(&mut session, &gate, "read missing", emitter)
            .await
            .expect("turn");
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WireEvent::ToolCallResult {
                result: ToolResultPayload::Error { .. },
                ..
            }
        )));
        assert_eq!(events.last(), Some(&WireEvent::StreamEnd {}));
    }

    struct Stall {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Tool for Stall {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "read_file".to_string(),
                description: "stalls until released".to_string(),
                parameters_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _arguments: serde_json::Value) -> tg_tools::Result<serde_json::Value> {
            self.release.notified().await;
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn disconnect_mid_tool_aborts_and_keeps_state() {
        let release = Arc::new(Notify::new());
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(Stall {
                release: release.clone(),
            }))
            .expect("register");
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_turn(
            "c8",
            "read_file",
            json!({"path": "a.txt"}),
        )]);
        let orchestrator = Arc::new(Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            Arc::new(registry),
        ));
        let gate = gate();
        let (emitter, mut rx) = emitter::channel(64);

        let run = {
            let orchestrator = orchestrator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut session = session();
                let result = orchestrator
                    .run_turn(&mut session, &gate, "read", emitter)
                    .await;
                (session, result)
            })
        };
        while !matches!(next_event(&mut rx).await, WireEvent::ToolCallStart { .. }) {}
        drop(rx);
        release.notify_one();

        let (session, result) = run.await.expect("join");
        assert!(matches!(result, Err(TurnError::Disconnected)));
        assert_eq!(
            session.state.get(Scope::Session, TURN_COUNT_KEY),
            Some(&json!(1))
        );
        assert_eq!(
            gate.status("c8"),
            Some(crate::approval::InvocationStatus::Executed)
        );
    }

    #[tokio::test]
    async fn disconnect_while_awaiting_approval_denies() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_turn(
            "c9",
            "write_file",
            json!({"path": "z.txt", "content": "z"}),
        )]);
        let orchestrator = Arc::new(Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        ));
        let gate = gate();
        let (emitter, mut rx) = emitter::channel(64);

        let run = {
            let orchestrator = orchestrator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut session = session();
                orchestrator
                    .run_turn(&mut session, &gate, "write z", emitter)
                    .await
            })
        };
        while !matches!(next_event(&mut rx).await, WireEvent::ApprovalRequired { .. }) {}
        drop(rx);

        let result = run.await.expect("join");
        assert!(matches!(result, Err(TurnError::Disconnected)));
        assert_eq!(
            gate.status("c9"),
            Some(crate::approval::InvocationStatus::Rejected)
        );
        assert!(!tmp.path().join("z.txt").exists());
    }

    /// Replays fixed items, optionally holding the stream until released.
    struct Held {
        release: Option<Arc<Notify>>,
        items: std::sync::Mutex<Option<Vec<tg_llm::Result<InferenceEvent>>>>,
    }

    impl Held {
        fn new(release: Option<Arc<Notify>>, items: Vec<tg_llm::Result<InferenceEvent>>) -> Self {
            Self {
                release,
                items: std::sync::Mutex::new(Some(items)),
            }
        }
    }

    #[async_trait]
    impl InferenceProvider for Held {
        fn name(&self) -> &str {
            "held"
        }

        async fn stream_turn(
            &self,
            _messages: &[ChatMessage],
            _tools: &[tg_llm::ToolDefinition],
        ) -> tg_llm::Result<tg_llm::InferenceStream> {
            let items = self.items.lock().unwrap().take().unwrap_or_default();
            let release = self.release.clone();
            let hold = futures_util::stream::once(async move {
                if let Some(release) = release {
                    release.notified().await;
                }
            })
            .filter_map(|()| async { None::<tg_llm::Result<InferenceEvent>> });
            Ok(Box::pin(hold.chain(futures_util::stream::iter(items))))
        }
    }

    fn tool_call(id: &str, tool: &str, arguments: serde_json::Value) -> InferenceEvent {
        let serde_json::Value::Object(arguments) = arguments else {
            panic!("arguments must be an object");
        };
        InferenceEvent::ToolCall(ToolInvocationRequest::new(id, tool, arguments))
    }

    #[tokio::test]
    async fn disconnect_before_approval_announced_denies() {
        let tmp = tempfile::tempdir().unwrap();
        let release = Arc::new(Notify::new());
        let provider = Held::new(
            Some(release.clone()),
            vec![
                Ok(tool_call("c10", "write_file", json!({"path": "y.txt", "content": "y"}))),
                Ok(InferenceEvent::End {
                    usage: Usage::default(),
                }),
            ],
        );
        let orchestrator = Arc::new(Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        ));
        let gate = gate();
        let (emitter, mut rx) = emitter::channel(64);

        let run = {
            let orchestrator = orchestrator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut session = session();
                orchestrator
                    .run_turn(&mut session, &gate, "write y", emitter)
                    .await
            })
        };
        assert!(matches!(next_event(&mut rx).await, WireEvent::StateUpdate { .. }));
        drop(rx);
        release.notify_one();

        let result = run.await.expect("join");
        assert!(matches!(result, Err(TurnError::Disconnected)));
        assert_eq!(
            gate.status("c10"),
            Some(crate::approval::InvocationStatus::Rejected)
        );
        assert!(gate.pending().is_empty());
        assert!(!tmp.path().join("y.txt").exists());
    }

    #[tokio::test]
    async fn reused_invocation_id_ends_stream_and_clears_pending() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let provider = ScriptedProvider::new(vec![vec![
            tool_call("dup", "read_file", json!({"path": "a.txt"})),
            tool_call("dup", "write_file", json!({"path": "b.txt", "content": "b"})),
            InferenceEvent::End {
                usage: Usage::default(),
            },
        ]]);
        let orchestrator = Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        );
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        let result = orchestrator
            .run_turn(&mut session, &gate, "copy a to b", emitter)
            .await;
        assert!(matches!(result, Err(TurnError::Translation(_))));
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&WireEvent::StreamEnd {}));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, WireEvent::ApprovalRequired { .. }))
        );
        assert!(gate.pending().is_empty());
        assert_eq!(
            gate.status("dup"),
            Some(crate::approval::InvocationStatus::Rejected)
        );
        assert!(!tmp.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn inference_error_still_closes_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Held::new(
            None,
            vec![
                Ok(InferenceEvent::TextDelta("Working on ".to_string())),
                Err(LlmError::Transport("connection reset".to_string())),
            ],
        );
        let orchestrator = Orchestrator::new(
            TurnSettings::default(),
            Arc::new(provider),
            workspace_registry(tmp.path()),
        );
        let gate = gate();
        let mut session = session();
        let (emitter, mut rx) = emitter::channel(64);

        let result = orchestrator
            .run_turn(&mut session, &gate, "hello", emitter)
            .await;
        assert!(matches!(result, Err(TurnError::Inference(_))));
        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events),
            vec!["StateUpdate", "TextDelta", "StreamEnd"]
        );
        assert_eq!(
            session.history.last().map(|m| m.content.as_str()),
            Some("Working on ")
        );
    }
}
