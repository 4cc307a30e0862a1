//! Maps orchestration-loop events onto the client wire protocol.
//!
//! The translator is the only place that knows the wire shapes. It also
//! tracks where each invocation is in its lifecycle so ordering mistakes in
//! the loop surface as errors instead of confusing clients.

use crate::approval::{ApprovalDecision, ApprovalRequired};
use crate::state::{Scope, StateChange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tg_llm::ToolInvocationRequest;
use thiserror::Error;

const REJECTED_REASON: &str = "The user rejected this action. The tool was not run.";

/// Events as clients receive them. The `type` tag is part of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireEvent {
    TextDelta {
        content: String,
    },
    ToolCallStart {
        invocation_id: String,
        tool_name: String,
        arguments: serde_json::Map<String, serde_json::Value>,
    },
    ApprovalRequired {
        invocation_id: String,
        tool_name: String,
        arguments: serde_json::Map<String, serde_json::Value>,
        risk_reason: String,
    },
    ToolCallResult {
        invocation_id: String,
        result: ToolResultPayload,
    },
    StateUpdate {
        scope: Scope,
        key: String,
        value: serde_json::Value,
    },
    StreamEnd {},
}

impl WireEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WireEvent::TextDelta { .. } => "TextDelta",
            WireEvent::ToolCallStart { .. } => "ToolCallStart",
            WireEvent::ApprovalRequired { .. } => "ApprovalRequired",
            WireEvent::ToolCallResult { .. } => "ToolCallResult",
            WireEvent::StateUpdate { .. } => "StateUpdate",
            WireEvent::StreamEnd {} => "StreamEnd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResultPayload {
    Success {
        output: serde_json::Value,
    },
    Rejected {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Error {
        error: String,
    },
}

impl ToolResultPayload {
    pub fn rejected(note: Option<String>) -> Self {
        ToolResultPayload::Rejected {
            reason: REJECTED_REASON.to_string(),
            note,
        }
    }

    /// The text appended to history as the tool message.
    pub fn to_model_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","error":"unserializable tool result: {e}"}}"#)
        })
    }
}

/// What the orchestration loop observed. Each maps to at most one [`WireEvent`].
#[derive(Debug, Clone)]
pub enum LoopEvent {
    ModelText(String),
    ToolAllowed(ToolInvocationRequest),
    ApprovalRequested(ApprovalRequired),
    ApprovalResolved {
        request: ToolInvocationRequest,
        decision: ApprovalDecision,
    },
    ToolCompleted {
        invocation_id: String,
        outcome: Result<serde_json::Value, String>,
    },
    StateChanged(StateChange),
    TurnEnded,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("invocation {invocation_id}: {detail}")]
    OutOfOrder {
        invocation_id: String,
        detail: String,
    },
    #[error("event translated after StreamEnd")]
    StreamEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingApproval,
    Running,
    Completed,
}

/// Per-stream translator. Not shared between streams.
#[derive(Debug, Default)]
pub struct EventTranslator {
    phases: HashMap<String, Phase>,
    ended: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Invocations that started but never reached a result.
    pub fn open_invocations(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .phases
            .iter()
            .filter(|(_, phase)| **phase != Phase::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        open
    }

    pub fn translate(&mut self, event: LoopEvent) -> Result<Option<WireEvent>, TranslateError> {
        if self.ended {
            return Err(TranslateError::StreamEnded);
        }
        let wire = match event {
            LoopEvent::ModelText(content) => {
                if content.is_empty() {
                    return Ok(None);
                }
                WireEvent::TextDelta { content }
            }
            LoopEvent::ToolAllowed(request) => {
                self.start(&request.invocation_id, Phase::Running)?;
                tool_call_start(request)
            }
            LoopEvent::ApprovalRequested(required) => {
                self.start(&required.invocation_id, Phase::AwaitingApproval)?;
                WireEvent::ApprovalRequired {
                    invocation_id: required.invocation_id,
                    tool_name: required.tool_name,
                    arguments: required.arguments,
                    risk_reason: required.risk_reason,
                }
            }
            LoopEvent::ApprovalResolved { request, decision } => {
                self.advance(
                    &request.invocation_id,
                    Phase::AwaitingApproval,
                    if decision.approved {
                        Phase::Running
                    } else {
                        Phase::Completed
                    },
                )?;
                if decision.approved {
                    tool_call_start(request)
                } else {
                    WireEvent::ToolCallResult {
                        invocation_id: request.invocation_id,
                        result: ToolResultPayload::rejected(decision.responder_note),
                    }
                }
            }
            LoopEvent::ToolCompleted {
                invocation_id,
                outcome,
            } => {
                self.advance(&invocation_id, Phase::Running, Phase::Completed)?;
                let result = match outcome {
                    Ok(output) => ToolResultPayload::Success { output },
                    Err(error) => ToolResultPayload::Error { error },
                };
                WireEvent::ToolCallResult {
                    invocation_id,
                    result,
                }
            }
            LoopEvent::StateChanged(change) => WireEvent::StateUpdate {
                scope: change.scope,
                key: change.key,
                value: change.value,
            },
            LoopEvent::TurnEnded => {
                self.ended = true;
                WireEvent::StreamEnd {}
            }
        };
        Ok(Some(wire))
    }

    fn start(&mut self, invocation_id: &str, phase: Phase) -> Result<(), TranslateError> {
        if self.phases.contains_key(invocation_id) {
            return Err(TranslateError::OutOfOrder {
                invocation_id: invocation_id.to_string(),
                detail: "invocation id reused within one stream".to_string(),
            });
        }
        self.phases.insert(invocation_id.to_string(), phase);
        Ok(())
    }

    fn advance(&mut self, invocation_id: &str, from: Phase, to: Phase) -> Result<(), TranslateError> {
        match self.phases.get_mut(invocation_id) {
            Some(phase) if *phase == from => {
                *phase = to;
                Ok(())
            }
            Some(phase) => Err(TranslateError::OutOfOrder {
                invocation_id: invocation_id.to_string(),
                detail: format!("expected {from:?}, found {phase:?}"),
            }),
            None => Err(TranslateError::OutOfOrder {
                invocation_id: invocation_id.to_string(),
                detail: "unknown invocation".to_string(),
            }),
        }
    }
}

fn tool_call_start(request: ToolInvocationRequest) -> WireEvent {
    WireEvent::ToolCallStart {
        invocation_id: request.invocation_id,
        tool_name: request.tool_name,
        arguments: request.arguments,
    }
}
