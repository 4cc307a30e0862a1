//! Provider abstraction and the chunk-to-event adapter.
//!
//! Providers stream whatever shape their API produces ([`StreamChunk`]).
//! [`assemble_events`] is the single place that turns those chunks into the
//! stable [`InferenceEvent`] sequence the orchestration loop consumes.

use crate::error::{LlmError, Result};
use crate::types::{
    ChatMessage, InferenceEvent, StreamChunk, ToolDefinition, ToolInvocationRequest, Usage,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

pub type InferenceStream = Pin<Box<dyn Stream<Item = Result<InferenceEvent>> + Send>>;

/// A model that can answer one conversation turn as a lazy event stream.
///
/// The stream is finite and always terminates with [`InferenceEvent::End`]
/// unless an error item is yielded first. It can be restarted by calling
/// `stream_turn` again but never resumed mid-stream.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<InferenceStream>;
}

#[derive(Debug)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

struct AssemblyState<S> {
    chunks: S,
    current: Option<PartialToolCall>,
    queue: VecDeque<Result<InferenceEvent>>,
    finished: bool,
}

impl<S> AssemblyState<S> {
    fn flush_current(&mut self) {
        if let Some(partial) = self.current.take() {
            let item = parse_arguments(&partial.id, &partial.arguments).map(|arguments| {
                InferenceEvent::ToolCall(ToolInvocationRequest::new(
                    partial.id,
                    partial.name,
                    arguments,
                ))
            });
            self.queue.push_back(item);
        }
    }

    fn finish(&mut self, usage: Usage) {
        self.flush_current();
        self.queue.push_back(Ok(InferenceEvent::End { usage }));
        self.finished = true;
    }
}

/// Assemble provider chunks into complete events.
///
/// A tool call is complete once any other chunk arrives (text, another tool
/// call start, or `Done`). If the provider stream ends without `Done`, pending
/// calls are still flushed and `End` is yielded with zero usage. The first
/// error item stops the stream.
pub fn assemble_events<S>(chunks: S) -> InferenceStream
where
    S: Stream<Item = Result<StreamChunk>> + Send + Unpin + 'static,
{
    let state = AssemblyState {
        chunks,
        current: None,
        queue: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.chunks.next().await {
                Some(Ok(StreamChunk::Delta { content })) => {
                    state.flush_current();
                    if !content.is_empty() {
                        state
                            .queue
                            .push_back(Ok(InferenceEvent::TextDelta(content)));
                    }
                }
                Some(Ok(StreamChunk::ToolCallStart { id, name })) => {
                    state.flush_current();
                    tracing::debug!(tool_call_id = %id, tool_name = %name, "tool call assembly started");
                    state.current = Some(PartialToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
                Some(Ok(StreamChunk::ToolCallDelta { arguments })) => match state.current.as_mut() {
                    Some(partial) => partial.arguments.push_str(&arguments),
                    None => {
                        state.finished = true;
                        return Some((
                            Err(LlmError::Decode(
                                "tool call arguments arrived before any tool call start"
                                    .to_string(),
                            )),
                            state,
                        ));
                    }
                },
                Some(Ok(StreamChunk::Done { usage })) => state.finish(usage),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    tracing::debug!("provider stream ended without done marker");
                    state.finish(Usage::default());
                }
            }
        }
    }))
}

fn parse_arguments(
    invocation_id: &str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| LlmError::MalformedToolCall {
            invocation_id: invocation_id.to_string(),
            reason: format!("arguments are not valid json: {e}"),
        })?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(LlmError::MalformedToolCall {
            invocation_id: invocation_id.to_string(),
            reason: format!("arguments must be a json object, got {other}"),
        }),
    }
}
