// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent delegation.
//!
//! A delegated child is a fresh agent with a generated id and inherited
//! config; it refers to its parent only through the `lineage` id list.
//! While the child runs, its progress and control events are forwarded onto
//! the parent's monitor channel, then the child is disposed.

use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use runa_events::{AgentEvent, Channel};

use crate::agent::{Agent, AgentDeps, RunStopReason};
use crate::error::CoreError;

#[derive(Debug, Clone, Default)]
pub struct DelegateRequest {
    pub template_id: Option<String>,
    pub prompt: String,
    /// Tool-id override for the child; `None` inherits the parent's set.
    pub tools: Option<Vec<String>>,
    /// Model override for the child.
    pub model: Option<String>,
    /// Tool-call id the delegation is answering, for correlation.
    pub call_id: Option<String>,
    /// Forward the child's events to the parent's monitor channel.
    pub stream_events: bool,
}

impl DelegateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stream_events: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateStatus {
    Ok,
    Paused,
}

#[derive(Debug, Clone)]
pub struct DelegateResult {
    pub status: DelegateStatus,
    pub text: Option<String>,
    pub permission_ids: Vec<String>,
    pub agent_id: String,
}

impl Agent {
    /// Spawn a child agent, run it with the given prompt, and return its
    /// final text.  Recursion is bounded by `subagents.depth`.
    pub async fn delegate_task(&self, req: DelegateRequest) -> Result<DelegateResult, CoreError> {
        let parent = &self.inner;
        if parent.lineage.len() + 1 > parent.config.subagents.depth {
            return Err(CoreError::Configuration(format!(
                "sub-agent depth limit ({}) reached",
                parent.config.subagents.depth
            )));
        }

        let mut config = parent.config.clone();
        if let Some(model) = &req.model {
            config.model = model.clone();
        }
        if let Some(tools) = &req.tools {
            config.tools = tools.clone();
        }
        if let Some(mode) = &parent.config.subagents.permission_override {
            config.permissions.mode = mode.clone();
        }

        let child_id = format!("{}.sub-{}", parent.id, &Uuid::new_v4().to_string()[..8]);
        let mut lineage = parent.lineage.clone();
        lineage.push(parent.id.clone());

        let deps = AgentDeps {
            provider: parent.provider.clone(),
            store: parent.store.clone(),
            registry: parent.registry.clone(),
            sandbox: parent.sandbox.clone(),
            hooks: parent.hooks.clone(),
        };
        let child = Agent::create_inner(
            child_id.clone(),
            config,
            deps,
            lineage,
            req.template_id.clone(),
        )
        .await?;
        debug!(parent = %parent.id, child = %child_id, "delegating task to sub-agent");

        let forwarder = if req.stream_events {
            let mut sub = child
                .subscribe(&[Channel::Progress, Channel::Control], None, None)
                .await;
            let parent_bus = parent.bus.clone();
            let agent_id = child_id.clone();
            Some(tokio::spawn(async move {
                while let Some(env) = sub.next().await {
                    let forwarded = match env.event {
                        AgentEvent::TextChunk { text } => Some(AgentEvent::SubagentDelta {
                            agent_id: agent_id.clone(),
                            text,
                        }),
                        AgentEvent::ThinkChunk { text } => Some(AgentEvent::SubagentThinking {
                            agent_id: agent_id.clone(),
                            text,
                        }),
                        AgentEvent::ToolStart { call_id, name } => {
                            Some(AgentEvent::SubagentToolStart {
                                agent_id: agent_id.clone(),
                                call_id,
                                name,
                            })
                        }
                        AgentEvent::ToolEnd {
                            call_id,
                            name,
                            is_error,
                        } => Some(AgentEvent::SubagentToolEnd {
                            agent_id: agent_id.clone(),
                            call_id,
                            name,
                            is_error,
                        }),
                        AgentEvent::PermissionRequired { call } => {
                            Some(AgentEvent::SubagentPermissionRequired {
                                agent_id: agent_id.clone(),
                                call_id: call.id,
                            })
                        }
                        _ => None,
                    };
                    if let Some(event) = forwarded {
                        parent_bus.emit(event).await;
                    }
                }
            }))
        } else {
            None
        };

        let run = child.run(&req.prompt).await;
        let permission_ids = child.pending_approval_ids().await;
        child.dispose().await;

        // Dropping the child releases its bus; the forwarder's subscription
        // then ends and the task drains whatever was still buffered.
        drop(child);
        if let Some(handle) = forwarder {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        }

        let result = run?;
        let status = if result.stop_reason == RunStopReason::AwaitingApproval {
            DelegateStatus::Paused
        } else {
            DelegateStatus::Ok
        };

        Ok(DelegateResult {
            status,
            text: result.response,
            permission_ids,
            agent_id: child_id,
        })
    }
}
