//! Human-in-the-loop gate in front of tool execution.
//!
//! Every invocation the model requests passes through [`ApprovalGate::evaluate`].
//! Safe tools proceed immediately. Everything else is parked as pending until
//! exactly one [`ApprovalDecision`] arrives through [`ApprovalGate::resolve`];
//! later decisions for the same invocation are rejected as stale.

use crate::state::{Scope, SessionState, counter_value};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tg_llm::ToolInvocationRequest;
use tg_tools::{RiskTier, ToolClassifier};
use thiserror::Error;
use tokio::sync::Notify;

/// Temp-scoped count of invocations that needed approval in the current cycle.
pub const TOOL_COUNT_KEY: &str = "tool_count";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("invocation {invocation_id} has no pending approval (already resolved or never suspended)")]
    StaleDecision { invocation_id: String },
}

/// Why a run was suspended, as shown to the approver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequired {
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
    pub risk_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub invocation_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn approve(invocation_id: impl Into<String>, note: Option<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            approved: true,
            responder_note: note,
            decided_at: Utc::now(),
        }
    }

    pub fn deny(invocation_id: impl Into<String>, note: Option<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            approved: false,
            responder_note: note,
            decided_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Proceed,
    Suspend(ApprovalRequired),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    PendingApproval,
    Approved,
    Executed,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    #[serde(flatten)]
    pub request: ApprovalRequired,
    pub requested_at: DateTime<Utc>,
}

/// One gate per conversation. Pending entries and outcomes are keyed by
/// invocation id; the waiter for an id is woken through its own [`Notify`].
pub struct ApprovalGate {
    classifier: Arc<ToolClassifier>,
    pending: DashMap<String, PendingApproval>,
    outcomes: DashMap<String, ApprovalDecision>,
    statuses: DashMap<String, InvocationStatus>,
    notifiers: DashMap<String, Arc<Notify>>,
}

impl ApprovalGate {
    pub fn new(classifier: Arc<ToolClassifier>) -> Self {
        Self {
            classifier,
            pending: DashMap::new(),
            outcomes: DashMap::new(),
            statuses: DashMap::new(),
            notifiers: DashMap::new(),
        }
    }

    /// Decide whether `request` may run now. Suspending bumps `temp:tool_count`.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(tool_call_id = %request.invocation_id, tool_name = %request.tool_name)
    )]
    pub fn evaluate(
        &self,
        request: &ToolInvocationRequest,
        state: &mut SessionState,
    ) -> GateDecision {
        match self.classifier.classify(&request.tool_name) {
            RiskTier::Safe => {
                // Safe calls go straight to Executed via `record_executed`.
                tracing::debug!("tool classified safe; proceeding");
                GateDecision::Proceed
            }
            RiskTier::RequiresApproval => {
                let count = counter_value(state.get(Scope::Temp, TOOL_COUNT_KEY)) + 1;
                state.set(Scope::Temp, TOOL_COUNT_KEY, serde_json::json!(count));

                let id = request.invocation_id.clone();
                let required = ApprovalRequired {
                    invocation_id: id.clone(),
                    tool_name: request.tool_name.clone(),
                    arguments: request.arguments.clone(),
                    risk_reason: self.risk_reason(&request.tool_name),
                };
                self.outcomes.remove(&id);
                self.notifiers.insert(id.clone(), Arc::new(Notify::new()));
                self.statuses
                    .insert(id.clone(), InvocationStatus::PendingApproval);
                self.pending.insert(
                    id,
                    PendingApproval {
                        request: required.clone(),
                        requested_at: Utc::now(),
                    },
                );
                tracing::info!(tool_count = count, "tool call suspended for approval");
                GateDecision::Suspend(required)
            }
        }
    }

    fn risk_reason(&self, tool_name: &str) -> String {
        if self.classifier.is_known(tool_name) {
            format!("`{tool_name}` can change state outside this conversation")
        } else {
            format!("`{tool_name}` is not a recognised tool; unknown tools always need approval")
        }
    }

    /// Record the single decision for a pending invocation.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(tool_call_id = %decision.invocation_id, approved = decision.approved)
    )]
    pub fn resolve(&self, decision: ApprovalDecision) -> Result<(), GateError> {
        let id = decision.invocation_id.clone();
        if self.pending.remove(&id).is_none() {
            tracing::warn!("stale approval decision rejected");
            return Err(GateError::StaleDecision { invocation_id: id });
        }
        let status = if decision.approved {
            InvocationStatus::Approved
        } else {
            InvocationStatus::Rejected
        };
        self.statuses.insert(id.clone(), status);
        self.outcomes.insert(id.clone(), decision);
        let notify = self.notifiers.get(&id).map(|n| n.value().clone());
        if let Some(notify) = notify {
            notify.notify_one();
        }
        tracing::info!("approval resolved");
        Ok(())
    }

    /// Wait for the decision on a suspended invocation.
    ///
    /// If nothing arrives within `timeout` the invocation is denied with a
    /// timeout note. A real decision that lands before the synthesized one
    /// wins.
    pub async fn wait_for_decision(
        &self,
        invocation_id: &str,
        timeout: Duration,
    ) -> Result<ApprovalDecision, GateError> {
        let notify = self.notifiers.get(invocation_id).map(|n| n.value().clone());
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(decision) = self.take_outcome(invocation_id) {
                return Ok(decision);
            }
            let Some(notify) = notify.as_ref() else {
                return Err(GateError::StaleDecision {
                    invocation_id: invocation_id.to_string(),
                });
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                let note = format!("approval timed out after {}s", timeout.as_secs());
                if self
                    .resolve(ApprovalDecision::deny(invocation_id, Some(note)))
                    .is_err()
                {
                    tracing::debug!(tool_call_id = %invocation_id, "real decision won the timeout race");
                }
                return self.take_outcome(invocation_id).ok_or_else(|| {
                    GateError::StaleDecision {
                        invocation_id: invocation_id.to_string(),
                    }
                });
            }
        }
    }

    fn take_outcome(&self, invocation_id: &str) -> Option<ApprovalDecision> {
        let (_, decision) = self.outcomes.remove(invocation_id)?;
        self.notifiers.remove(invocation_id);
        Some(decision)
    }

    /// Mark an approved (or safe) invocation as having run.
    pub fn record_executed(&self, invocation_id: &str) {
        self.statuses
            .insert(invocation_id.to_string(), InvocationStatus::Executed);
    }

    pub fn status(&self, invocation_id: &str) -> Option<InvocationStatus> {
        self.statuses.get(invocation_id).map(|s| *s.value())
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut out: Vec<PendingApproval> =
            self.pending.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> ApprovalGate {
        ApprovalGate::new(Arc::new(ToolClassifier::default()))
    }

    fn request(id: &str, tool: &str) -> ToolInvocationRequest {
        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), json!("notes.md"));
        ToolInvocationRequest::new(id, tool, args)
    }

    #[test]
    fn safe_tools_proceed_without_touching_state() {
        let gate = gate();
        let mut state = SessionState::new();
        let decision = gate.evaluate(&request("call-1", "read_file"), &mut state);
        assert_eq!(decision, GateDecision::Proceed);
        assert!(state.get(Scope::Temp, TOOL_COUNT_KEY).is_none());
        assert!(gate.pending().is_empty());
        assert_eq!(gate.status("call-1"), None);

        gate.record_executed("call-1");
        assert_eq!(gate.status("call-1"), Some(InvocationStatus::Executed));
    }

    #[test]
    fn gated_tools_suspend_and_count() {
        let gate = gate();
        let mut state = SessionState::new();
        let GateDecision::Suspend(required) =
            gate.evaluate(&request("call-1", "write_file"), &mut state)
        else {
            panic!("write_file must suspend");
        };
        assert_eq!(required.invocation_id, "call-1");
        assert_eq!(required.arguments["path"], json!("notes.md"));
        assert_eq!(state.get(Scope::Temp, TOOL_COUNT_KEY), Some(&json!(1)));

        gate.evaluate(&request("call-2", "refund_order"), &mut state);
        assert_eq!(state.get(Scope::Temp, TOOL_COUNT_KEY), Some(&json!(2)));
        assert_eq!(gate.pending().len(), 2);
        assert_eq!(
            gate.status("call-2"),
            Some(InvocationStatus::PendingApproval)
        );
    }

    #[test]
    fn unknown_tools_get_a_distinct_reason() {
        let gate = gate();
        let mut state = SessionState::new();
        let GateDecision::Suspend(required) =
            gate.evaluate(&request("call-9", "refund_order"), &mut state)
        else {
            panic!("unknown tools must suspend");
        };
        assert!(required.risk_reason.contains("not a recognised tool"));
    }

    #[test]
    fn resolve_is_single_shot() {
        let gate = gate();
        let mut state = SessionState::new();
        gate.evaluate(&request("call-1", "write_file"), &mut state);

        gate.resolve(ApprovalDecision::approve("call-1", None))
            .expect("first decision");
        let err = gate
            .resolve(ApprovalDecision::deny("call-1", None))
            .unwrap_err();
        assert_eq!(
            err,
            GateError::StaleDecision {
                invocation_id: "call-1".to_string()
            }
        );
        assert_eq!(gate.status("call-1"), Some(InvocationStatus::Approved));

        let err = gate
            .resolve(ApprovalDecision::approve("never-seen", None))
            .unwrap_err();
        assert!(matches!(err, GateError::StaleDecision { .. }));
    }

    #[tokio::test]
    async fn waiter_receives_decision() {
        let gate = Arc::new(gate());
        let mut state = SessionState::new();
        gate.evaluate(&request("call-1", "write_file"), &mut state);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_for_decision("call-1", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        gate.resolve(ApprovalDecision::deny("call-1", Some("not today".into())))
            .expect("resolve");

        let decision = waiter.await.expect("join").expect("decision");
        assert!(!decision.approved);
        assert_eq!(decision.responder_note.as_deref(), Some("not today"));
        assert_eq!(gate.status("call-1"), Some(InvocationStatus::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_and_late_decision_is_stale() {
        let gate = gate();
        let mut state = SessionState::new();
        gate.evaluate(&request("call-1", "write_file"), &mut state);

        let decision = gate
            .wait_for_decision("call-1", Duration::from_secs(30))
            .await
            .expect("decision");
        assert!(!decision.approved);
        assert!(
            decision
                .responder_note
                .as_deref()
                .is_some_and(|n| n.contains("timed out"))
        );

        let late = gate.resolve(ApprovalDecision::approve("call-1", None));
        assert!(matches!(late, Err(GateError::StaleDecision { .. })));
    }

    #[tokio::test]
    async fn decision_before_wait_is_not_lost() {
        let gate = gate();
        let mut state = SessionState::new();
        gate.evaluate(&request("call-1", "write_file"), &mut state);
        gate.resolve(ApprovalDecision::approve("call-1", None))
            .expect("resolve");

        let decision = gate
            .wait_for_decision("call-1", Duration::from_millis(10))
            .await
            .expect("decision");
        assert!(decision.approved);
    }
}
