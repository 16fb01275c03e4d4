// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use runa_events::{AgentEvent, EventBus};
use runa_tools::{
    ApprovalDecision, PermissionPolicy, PolicyDecision, ToolCallRecord, ToolMeta,
};

use crate::error::CoreError;

pub(crate) type SharedRecords = Arc<Mutex<Vec<ToolCallRecord>>>;

/// A resolved approval.
#[derive(Debug, Clone)]
pub(crate) struct DecisionOutcome {
    pub decision: ApprovalDecision,
    pub decided_by: String,
    pub note: Option<String>,
}

/// Runtime approval surface on top of the mode-based [`PermissionPolicy`].
///
/// `request_approval` parks the caller on a oneshot until an external
/// `approve` / `deny` (or the in-process `respond` variant) resolves it.
/// The pending set is what distinguishes a legitimate `AWAITING_APPROVAL`
/// pause from a stale one on resume.
pub(crate) struct PermissionManager {
    policy: Mutex<PermissionPolicy>,
    bus: Arc<EventBus>,
    records: SharedRecords,
    pending: Mutex<HashMap<String, oneshot::Sender<DecisionOutcome>>>,
}

impl PermissionManager {
    pub fn new(policy: PermissionPolicy, bus: Arc<EventBus>, records: SharedRecords) -> Self {
        Self {
            policy: Mutex::new(policy),
            bus,
            records,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn decide_policy(&self, name: &str, input: &Value, meta: &ToolMeta) -> PolicyDecision {
        self.policy.lock().await.decide(name, input, meta)
    }

    pub async fn register_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&str, &Value, &ToolMeta) -> PolicyDecision + Send + Sync + 'static,
    {
        self.policy.lock().await.register_handler(name, handler);
    }

    /// Register a pending approval for `call_id`.
    ///
    /// Must happen before the agent transitions to `Paused`, so that a
    /// `Paused` state always has a pending approval backing it.
    pub async fn begin(&self, call_id: &str) -> oneshot::Receiver<DecisionOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id.to_string(), tx);
        rx
    }

    /// Announce the approval request and park until a decision arrives.
    pub async fn wait(
        &self,
        call: ToolCallRecord,
        rx: oneshot::Receiver<DecisionOutcome>,
    ) -> DecisionOutcome {
        let call_id = call.id.clone();
        self.bus
            .emit(AgentEvent::PermissionRequired { call })
            .await;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Sender dropped without a decision (dispose/interrupt).
                warn!(call_id = %call_id, "approval channel closed without a decision");
                DecisionOutcome {
                    decision: ApprovalDecision::Deny,
                    decided_by: "system".into(),
                    note: Some("approval channel closed".into()),
                }
            }
        }
    }

    /// Convenience for callers that do not pause between the two phases.
    pub async fn request_approval(&self, call: ToolCallRecord) -> DecisionOutcome {
        let rx = self.begin(&call.id).await;
        self.wait(call, rx).await
    }

    /// Resolve a pending approval: update the record's approval bookkeeping,
    /// emit `permission_decided`, and wake the parked tool call.
    pub async fn resolve(
        &self,
        call_id: &str,
        decision: ApprovalDecision,
        decided_by: &str,
        note: Option<String>,
    ) -> Result<(), CoreError> {
        let tx = self
            .pending
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| {
                CoreError::Configuration(format!("no pending approval for call '{call_id}'"))
            })?;

        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.iter_mut().find(|r| r.id == call_id) {
                record.approval.decision = Some(decision);
                record.approval.decided_by = Some(decided_by.to_string());
                record.approval.decided_at = Some(Utc::now());
                record.approval.note = note.clone();
            }
        }

        self.bus
            .emit(AgentEvent::PermissionDecided {
                call_id: call_id.to_string(),
                decision,
                decided_by: decided_by.to_string(),
                note: note.clone(),
            })
            .await;

        let _ = tx.send(DecisionOutcome {
            decision,
            decided_by: decided_by.to_string(),
            note,
        });
        Ok(())
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_pending(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }

    /// Drop all pending approvals (dispose/interrupt); parked calls observe a
    /// system deny.
    pub async fn clear_pending(&self) {
        self.pending.lock().await.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
