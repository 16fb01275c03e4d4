// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call processing: per-call lifecycle from registration through
//! hooks, validation, permission gating, and bounded execution.
//!
//! Calls within a batch run sequentially so a denial never aborts the
//! remaining calls; the per-agent semaphore still bounds execution for
//! parallel batches.  Batched results land in a single user message.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;

use runa_events::{AgentEvent, Breakpoint, ErrorPhase, ErrorSeverity, RuntimeState};
use runa_model::ContentBlock;
use runa_tools::{
    required_keys, validate_input, ApprovalDecision, PolicyDecision, Tool, ToolCallRecord,
    ToolCallState, ToolContext,
};

use crate::agent::AgentInner;
use crate::hooks::HookDecision;
use crate::permission::DecisionOutcome;

/// Invalid-argument recovery state, keyed by tool name.
///
/// Streak thresholds: at 2 consecutive failures the next model call exposes
/// only the failing tool; at 3 a schema nudge is prepended to the next user
/// turn; at 6 all tools are suppressed and the nudge asks for prose.
#[derive(Default)]
pub(crate) struct RecoveryState {
    pub streaks: HashMap<String, u32>,
    pub allowlist_tool: Option<String>,
    pub suppress_tools: bool,
    pub nudge: Option<String>,
}

impl RecoveryState {
    pub fn reset(&mut self) {
        self.streaks.clear();
        self.allowlist_tool = None;
        self.suppress_tools = false;
        self.nudge = None;
    }
}

pub(crate) struct BatchOutcome {
    pub blocks: Vec<ContentBlock>,
    pub interrupted: bool,
}

enum ExecOutcome {
    Done(runa_tools::ToolOutcome),
    TimedOut,
    Interrupted,
}

impl AgentInner {
    /// Process every tool use of one assistant turn, in order.
    pub(crate) async fn run_tool_batch(
        self: &Arc<Self>,
        uses: &[(String, String, Value)],
    ) -> anyhow::Result<BatchOutcome> {
        let mut blocks = Vec::new();
        let mut interrupted = false;

        for (call_id, name, input) in uses {
            if self.interrupt_requested.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }

            // 1. Register the authoritative record and announce the call.
            {
                let mut records = self.records.lock().await;
                if !records.iter().any(|r| r.id == *call_id) {
                    records.push(ToolCallRecord::new(
                        call_id.clone(),
                        name.clone(),
                        input.clone(),
                    ));
                }
            }
            self.persist_records().await?;
            self.bus
                .emit(AgentEvent::ToolStart {
                    call_id: call_id.clone(),
                    name: name.clone(),
                })
                .await;

            // 2. Pre-tool hook.
            let mut approval_reason: Option<String> = None;
            match self.hooks.pre_tool(name, input).await {
                HookDecision::Continue => {}
                HookDecision::Deny { reason } => {
                    blocks.push(self.deny_call(call_id, name, &reason).await?);
                    continue;
                }
                HookDecision::Skip { mock_result } => {
                    blocks.push(self.mock_call(call_id, name, mock_result).await?);
                    continue;
                }
                HookDecision::RequireApproval { reason } => approval_reason = Some(reason),
            }

            // 3. Enablement.
            let Some(tool) = self.tools.get(name).cloned() else {
                blocks.push(
                    self.deny_call(call_id, name, "Tool is not enabled for this agent")
                        .await?,
                );
                continue;
            };

            // 4. Input validation, with the escalating recovery streak.
            if let Err(reason) = validate_input(&tool.input_schema(), input) {
                blocks.push(self.invalid_args_call(call_id, name, &tool, &reason).await?);
                continue;
            }
            self.recovery.lock().await.streaks.remove(name);

            // 5. Hard deny / approval requirement from the mode policy.
            match self
                .permissions
                .decide_policy(name, input, &tool.meta())
                .await
            {
                PolicyDecision::Deny { reason } => {
                    blocks.push(self.deny_call(call_id, name, &reason).await?);
                    continue;
                }
                PolicyDecision::Ask { reason } => {
                    approval_reason.get_or_insert(reason);
                }
                PolicyDecision::Allow => {}
            }

            // 6. Approval gate.
            if let Some(reason) = approval_reason {
                let outcome = self.gate_approval(call_id, reason).await?;
                if outcome.decision == ApprovalDecision::Deny {
                    blocks.push(self.permission_denied_call(call_id, name).await?);
                    continue;
                }
                let mut records = self.records.lock().await;
                if let Some(record) = records.iter_mut().find(|r| r.id == *call_id) {
                    record.transition(
                        ToolCallState::Approved,
                        Some(format!("approved by {}", outcome.decided_by)),
                    );
                }
            }

            // 7. Execute, bounded by the per-agent semaphore and timeout.
            self.state.set_breakpoint(Breakpoint::PreTool).await;
            self.state.set_breakpoint(Breakpoint::ToolExecuting).await;
            let permit = self
                .tool_semaphore
                .acquire()
                .await
                .map_err(|_| anyhow!("tool semaphore closed"))?;
            self.touch_heartbeat().await;
            {
                let mut records = self.records.lock().await;
                if let Some(record) = records.iter_mut().find(|r| r.id == *call_id) {
                    record.transition(ToolCallState::Executing, None);
                }
            }
            self.persist_records().await?;

            let ctx = ToolContext {
                agent_id: self.id.clone(),
                sandbox: self.sandbox.clone(),
            };
            let timeout = Duration::from_secs(self.config.limits.tool_timeout_secs);
            let exec = tokio::select! {
                biased;
                _ = self.interrupt_notify.notified() => ExecOutcome::Interrupted,
                result = tokio::time::timeout(timeout, tool.execute(input, &ctx)) => {
                    match result {
                        Ok(outcome) => ExecOutcome::Done(outcome),
                        Err(_) => ExecOutcome::TimedOut,
                    }
                }
            };
            drop(permit);
            self.touch_heartbeat().await;

            match exec {
                ExecOutcome::Interrupted => {
                    // The record stays non-terminal; the interrupt path seals
                    // it and synthesizes the matching result.
                    interrupted = true;
                    break;
                }
                ExecOutcome::TimedOut => {
                    let message =
                        format!("tool '{name}' timed out after {}s", timeout.as_secs());
                    {
                        let mut records = self.records.lock().await;
                        if let Some(record) = records.iter_mut().find(|r| r.id == *call_id) {
                            record.fail(message.clone(), Some("timeout".into()));
                        }
                    }
                    self.persist_records().await?;
                    self.emit_tool_failure(call_id, name, &message).await;
                    blocks.push(ContentBlock::tool_result(call_id.clone(), message, true));
                }
                ExecOutcome::Done(mut outcome) => {
                    if let Some(overridden) = self.hooks.post_tool(name, &outcome).await {
                        outcome = overridden;
                    }
                    let content = outcome.content();
                    if outcome.success {
                        let duration_ms = {
                            let mut records = self.records.lock().await;
                            match records.iter_mut().find(|r| r.id == *call_id) {
                                Some(record) => {
                                    record.complete(content.clone());
                                    record.duration_ms.unwrap_or(0)
                                }
                                None => 0,
                            }
                        };
                        self.persist_records().await?;
                        self.bus
                            .emit(AgentEvent::ToolExecuted {
                                call_id: call_id.clone(),
                                name: name.clone(),
                                duration_ms,
                            })
                            .await;
                        self.bus
                            .emit(AgentEvent::ToolEnd {
                                call_id: call_id.clone(),
                                name: name.clone(),
                                is_error: false,
                            })
                            .await;
                        blocks.push(ContentBlock::tool_result(call_id.clone(), content, false));
                    } else {
                        {
                            let mut records = self.records.lock().await;
                            if let Some(record) = records.iter_mut().find(|r| r.id == *call_id) {
                                record.fail(content.clone(), None);
                            }
                        }
                        self.persist_records().await?;
                        self.emit_tool_failure(call_id, name, &content).await;
                        blocks.push(ContentBlock::tool_result(call_id.clone(), content, true));
                    }
                }
            }
        }

        // A nudge armed during this batch is prepended to the same user turn
        // so the next model call sees it.
        if let Some(nudge) = self.recovery.lock().await.nudge.take() {
            blocks.insert(0, ContentBlock::text(nudge));
        }

        Ok(BatchOutcome {
            blocks,
            interrupted,
        })
    }

    // ── Per-call outcomes ─────────────────────────────────────────────────────

    async fn deny_call(
        &self,
        call_id: &str,
        name: &str,
        reason: &str,
    ) -> anyhow::Result<ContentBlock> {
        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.iter_mut().find(|r| r.id == call_id) {
                record.deny(reason.to_string());
            }
        }
        self.persist_records().await?;
        self.bus
            .emit(AgentEvent::ToolEnd {
                call_id: call_id.to_string(),
                name: name.to_string(),
                is_error: true,
            })
            .await;
        Ok(ContentBlock::tool_result(call_id, reason, true))
    }

    async fn permission_denied_call(
        &self,
        call_id: &str,
        name: &str,
    ) -> anyhow::Result<ContentBlock> {
        self.deny_call(call_id, name, "Permission denied").await
    }

    async fn mock_call(
        &self,
        call_id: &str,
        name: &str,
        mock_result: String,
    ) -> anyhow::Result<ContentBlock> {
        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.iter_mut().find(|r| r.id == call_id) {
                record.transition(
                    ToolCallState::Completed,
                    Some("skipped by pre-tool hook".into()),
                );
                record.result = Some(mock_result.clone());
                record.is_error = false;
            }
        }
        self.persist_records().await?;
        self.bus
            .emit(AgentEvent::ToolEnd {
                call_id: call_id.to_string(),
                name: name.to_string(),
                is_error: false,
            })
            .await;
        Ok(ContentBlock::tool_result(call_id, mock_result, false))
    }

    async fn invalid_args_call(
        &self,
        call_id: &str,
        name: &str,
        tool: &Arc<dyn Tool>,
        reason: &str,
    ) -> anyhow::Result<ContentBlock> {
        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.iter_mut().find(|r| r.id == call_id) {
                record.fail(reason.to_string(), Some("input validation failed".into()));
            }
        }
        self.persist_records().await?;
        self.emit_tool_failure(call_id, name, reason).await;

        let streak = {
            let mut recovery = self.recovery.lock().await;
            let streak = recovery.streaks.entry(name.to_string()).or_insert(0);
            *streak += 1;
            let streak = *streak;
            if streak >= 6 {
                recovery.allowlist_tool = None;
                recovery.suppress_tools = true;
                recovery.nudge = Some(format!(
                    "Tool calls are disabled for your next reply because repeated calls to \
                     '{name}' had invalid arguments. Explain the problem you are running into \
                     in prose and propose next steps. Do not attempt another tool call."
                ));
            } else if streak >= 3 {
                let keys = required_keys(&tool.input_schema());
                let keys = if keys.is_empty() {
                    "none".to_string()
                } else {
                    keys.join(", ")
                };
                recovery.allowlist_tool = Some(name.to_string());
                recovery.nudge = Some(format!(
                    "Your last {streak} calls to '{name}' had invalid arguments \
                     ({reason}). The input must be a JSON object matching the tool's schema; \
                     required keys: {keys}. Provide every required key with the correct type."
                ));
            } else if streak >= 2 {
                recovery.allowlist_tool = Some(name.to_string());
            }
            streak
        };
        tracing::debug!(tool = name, streak, "invalid tool arguments");
        Ok(ContentBlock::tool_result(call_id, reason, true))
    }

    async fn emit_tool_failure(&self, call_id: &str, name: &str, message: &str) {
        self.bus
            .emit(AgentEvent::ToolError {
                call_id: call_id.to_string(),
                name: name.to_string(),
                error: message.to_string(),
            })
            .await;
        self.bus
            .emit(AgentEvent::Error {
                severity: ErrorSeverity::Warn,
                phase: ErrorPhase::Tool,
                message: format!("tool '{name}' failed: {message}"),
            })
            .await;
        self.bus
            .emit(AgentEvent::ToolEnd {
                call_id: call_id.to_string(),
                name: name.to_string(),
                is_error: true,
            })
            .await;
    }

    /// Pause for an approval decision; always returns to `Working` after the
    /// decision so the rest of the batch can run.
    async fn gate_approval(
        &self,
        call_id: &str,
        reason: String,
    ) -> anyhow::Result<DecisionOutcome> {
        let snapshot = {
            let mut records = self.records.lock().await;
            let record = records
                .iter_mut()
                .find(|r| r.id == call_id)
                .ok_or_else(|| anyhow!("tool-call record vanished for '{call_id}'"))?;
            record.approval.required = true;
            record.transition(ToolCallState::ApprovalRequired, Some(reason));
            record.clone()
        };
        self.persist_records().await?;

        // The pending entry must exist before Paused becomes observable.
        let rx = self.permissions.begin(call_id).await;
        self.state.set_breakpoint(Breakpoint::AwaitingApproval).await;
        self.state.set_state(RuntimeState::Paused).await;
        self.idle_notify.notify_waiters();
        // Persist the pause so a crash here resumes as stale-awaiting-approval.
        self.persist_meta().await?;

        let outcome = self.permissions.wait(snapshot, rx).await;

        self.state.set_state(RuntimeState::Working).await;
        self.state.set_breakpoint(Breakpoint::ToolPending).await;
        self.persist_records().await?;
        Ok(outcome)
    }
}
