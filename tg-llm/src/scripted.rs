//! Deterministic provider that replays pre-recorded turns.

use crate::error::Result;
use crate::provider::{InferenceProvider, InferenceStream};
use crate::types::{ChatMessage, InferenceEvent, ToolDefinition, ToolInvocationRequest, Usage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Each call to `stream_turn` pops the next scripted response. Once the
/// script is exhausted every call answers with `fallback_text`.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<InferenceEvent>>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    fallback_text: String,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<InferenceEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
            fallback_text: "Done.".to_string(),
        }
    }

    pub fn with_fallback_text(mut self, text: impl Into<String>) -> Self {
        self.fallback_text = text.into();
        self
    }

    /// Message lists passed to each call, oldest first.
    pub fn seen_requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    /// Convenience builder for a turn that requests one tool call.
    pub fn tool_turn(
        invocation_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Vec<InferenceEvent> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        vec![
            InferenceEvent::ToolCall(ToolInvocationRequest::new(
                invocation_id,
                tool_name,
                arguments,
            )),
            InferenceEvent::End {
                usage: Usage::default(),
            },
        ]
    }

    /// Convenience builder for a plain text answer streamed word by word.
    pub fn text_turn(text: &str) -> Vec<InferenceEvent> {
        let mut events: Vec<InferenceEvent> = text
            .split_inclusive(' ')
            .map(|piece| InferenceEvent::TextDelta(piece.to_string()))
            .collect();
        events.push(InferenceEvent::End {
            usage: Usage::default(),
        });
        events
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<InferenceStream> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let next = self
            .turns
            .lock()
            .ok()
            .and_then(|mut turns| turns.pop_front());
        let events = next.unwrap_or_else(|| Self::text_turn(&self.fallback_text));
        tracing::debug!(event_count = events.len(), "scripted provider replaying turn");
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }
}
