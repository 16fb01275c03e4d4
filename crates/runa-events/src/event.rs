// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use runa_tools::{ApprovalDecision, ToolCallRecord};

// ─── Channels ─────────────────────────────────────────────────────────────────

/// The three delivery channels of the agent event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

// ─── Runtime lifecycle enums ──────────────────────────────────────────────────

/// What the agent is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    Ready,
    Working,
    Paused,
    Failed,
}

impl RuntimeState {
    fn from_index(n: u64) -> Option<Self> {
        Some(match n {
            0 => RuntimeState::Ready,
            1 => RuntimeState::Working,
            2 => RuntimeState::Paused,
            3 => RuntimeState::Failed,
            _ => return None,
        })
    }
}

impl<'de> Deserialize<'de> for RuntimeState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        if let Some(n) = v.as_u64() {
            return RuntimeState::from_index(n)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown runtime state {n}")));
        }
        match v.as_str() {
            Some("READY") => Ok(RuntimeState::Ready),
            Some("WORKING") => Ok(RuntimeState::Working),
            Some("PAUSED") => Ok(RuntimeState::Paused),
            Some("FAILED") => Ok(RuntimeState::Failed),
            other => Err(serde::de::Error::custom(format!(
                "unknown runtime state {other:?}"
            ))),
        }
    }
}

/// Where inside a step the agent last checkpointed, for crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Breakpoint {
    Ready,
    PreModel,
    StreamingModel,
    ToolPending,
    AwaitingApproval,
    PreTool,
    ToolExecuting,
    PostTool,
}

impl Breakpoint {
    fn from_index(n: u64) -> Option<Self> {
        Some(match n {
            0 => Breakpoint::Ready,
            1 => Breakpoint::PreModel,
            2 => Breakpoint::StreamingModel,
            3 => Breakpoint::ToolPending,
            4 => Breakpoint::AwaitingApproval,
            5 => Breakpoint::PreTool,
            6 => Breakpoint::ToolExecuting,
            7 => Breakpoint::PostTool,
            _ => return None,
        })
    }
}

impl<'de> Deserialize<'de> for Breakpoint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        if let Some(n) = v.as_u64() {
            return Breakpoint::from_index(n)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown breakpoint {n}")));
        }
        match v.as_str() {
            Some("READY") => Ok(Breakpoint::Ready),
            Some("PRE_MODEL") => Ok(Breakpoint::PreModel),
            Some("STREAMING_MODEL") => Ok(Breakpoint::StreamingModel),
            Some("TOOL_PENDING") => Ok(Breakpoint::ToolPending),
            Some("AWAITING_APPROVAL") => Ok(Breakpoint::AwaitingApproval),
            Some("PRE_TOOL") => Ok(Breakpoint::PreTool),
            Some("TOOL_EXECUTING") => Ok(Breakpoint::ToolExecuting),
            Some("POST_TOOL") => Ok(Breakpoint::PostTool),
            other => Err(serde::de::Error::custom(format!(
                "unknown breakpoint {other:?}"
            ))),
        }
    }
}

// ─── Event payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    Model,
    Tool,
    System,
    Storage,
}

/// Every event the runtime emits, across all three channels.
///
/// The wire `type` string is the serde tag.  Unknown types deserialize to
/// [`AgentEvent::Unknown`] via [`AgentEvent::from_value`] rather than being
/// dropped, so newer writers do not break older readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    // ── progress ──────────────────────────────────────────────────────────────
    #[serde(rename = "text_chunk_start")]
    TextChunkStart,
    #[serde(rename = "text_chunk")]
    TextChunk { text: String },
    #[serde(rename = "text_chunk_end")]
    TextChunkEnd,
    #[serde(rename = "think_chunk_start")]
    ThinkChunkStart,
    #[serde(rename = "think_chunk")]
    ThinkChunk { text: String },
    #[serde(rename = "think_chunk_end")]
    ThinkChunkEnd,
    #[serde(rename = "tool:start")]
    ToolStart { call_id: String, name: String },
    #[serde(rename = "tool:end")]
    ToolEnd {
        call_id: String,
        name: String,
        is_error: bool,
    },
    #[serde(rename = "tool:error")]
    ToolError {
        call_id: String,
        name: String,
        error: String,
    },
    #[serde(rename = "done")]
    Done { step: u64, reason: DoneReason },

    // ── control ───────────────────────────────────────────────────────────────
    #[serde(rename = "permission_required")]
    PermissionRequired { call: ToolCallRecord },
    #[serde(rename = "permission_decided")]
    PermissionDecided {
        call_id: String,
        decision: ApprovalDecision,
        decided_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    // ── monitor ───────────────────────────────────────────────────────────────
    #[serde(rename = "state_changed")]
    StateChanged {
        from: RuntimeState,
        to: RuntimeState,
    },
    #[serde(rename = "breakpoint_changed")]
    BreakpointChanged { from: Breakpoint, to: Breakpoint },
    #[serde(rename = "token_usage")]
    TokenUsage {
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    },
    #[serde(rename = "step_complete")]
    StepComplete { step: u64, duration_ms: u64 },
    #[serde(rename = "tool_executed")]
    ToolExecuted {
        call_id: String,
        name: String,
        duration_ms: u64,
    },
    #[serde(rename = "error")]
    Error {
        severity: ErrorSeverity,
        phase: ErrorPhase,
        message: String,
    },
    #[serde(rename = "context_compression")]
    ContextCompression {
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ratio: Option<f32>,
    },
    #[serde(rename = "context_repair")]
    ContextRepair { reason: String, converted: usize },
    #[serde(rename = "scheduler_triggered")]
    SchedulerTriggered {
        task_id: String,
        spec: String,
        kind: String,
        triggered_at: i64,
    },
    #[serde(rename = "skill_activated")]
    SkillActivated { skill: String, activated_by: String },
    #[serde(rename = "agent_resumed")]
    AgentResumed { strategy: String, sealed: Vec<Value> },
    #[serde(rename = "agent_recovered")]
    AgentRecovered { reason: String },
    #[serde(rename = "storage_failure")]
    StorageFailure { message: String, failed_count: usize },

    // Child progress/control forwarded onto the parent's monitor channel.
    #[serde(rename = "subagent.delta")]
    SubagentDelta { agent_id: String, text: String },
    #[serde(rename = "subagent.thinking")]
    SubagentThinking { agent_id: String, text: String },
    #[serde(rename = "subagent.tool_start")]
    SubagentToolStart {
        agent_id: String,
        call_id: String,
        name: String,
    },
    #[serde(rename = "subagent.tool_end")]
    SubagentToolEnd {
        agent_id: String,
        call_id: String,
        name: String,
        is_error: bool,
    },
    #[serde(rename = "subagent.permission_required")]
    SubagentPermissionRequired { agent_id: String, call_id: String },

    /// Degradation target for wire events this build does not know.
    /// Never serialized directly; [`EventEnvelope`] writes `raw` instead.
    #[serde(skip)]
    Unknown { event_type: String, raw: Value },
}

impl AgentEvent {
    /// The channel this event is published on.
    pub fn channel(&self) -> Channel {
        use AgentEvent::*;
        match self {
            TextChunkStart | TextChunk { .. } | TextChunkEnd | ThinkChunkStart
            | ThinkChunk { .. } | ThinkChunkEnd | ToolStart { .. } | ToolEnd { .. }
            | ToolError { .. } | Done { .. } => Channel::Progress,
            PermissionRequired { .. } | PermissionDecided { .. } => Channel::Control,
            Unknown { raw, .. } => raw
                .get("channel")
                .and_then(|c| serde_json::from_value(c.clone()).ok())
                .unwrap_or(Channel::Monitor),
            _ => Channel::Monitor,
        }
    }

    /// The wire `type` string used by subscription `kinds` filters.
    pub fn kind(&self) -> &str {
        use AgentEvent::*;
        match self {
            TextChunkStart => "text_chunk_start",
            TextChunk { .. } => "text_chunk",
            TextChunkEnd => "text_chunk_end",
            ThinkChunkStart => "think_chunk_start",
            ThinkChunk { .. } => "think_chunk",
            ThinkChunkEnd => "think_chunk_end",
            ToolStart { .. } => "tool:start",
            ToolEnd { .. } => "tool:end",
            ToolError { .. } => "tool:error",
            Done { .. } => "done",
            PermissionRequired { .. } => "permission_required",
            PermissionDecided { .. } => "permission_decided",
            StateChanged { .. } => "state_changed",
            BreakpointChanged { .. } => "breakpoint_changed",
            TokenUsage { .. } => "token_usage",
            StepComplete { .. } => "step_complete",
            ToolExecuted { .. } => "tool_executed",
            Error { .. } => "error",
            ContextCompression { .. } => "context_compression",
            ContextRepair { .. } => "context_repair",
            SchedulerTriggered { .. } => "scheduler_triggered",
            SkillActivated { .. } => "skill_activated",
            AgentResumed { .. } => "agent_resumed",
            AgentRecovered { .. } => "agent_recovered",
            StorageFailure { .. } => "storage_failure",
            SubagentDelta { .. } => "subagent.delta",
            SubagentThinking { .. } => "subagent.thinking",
            SubagentToolStart { .. } => "subagent.tool_start",
            SubagentToolEnd { .. } => "subagent.tool_end",
            SubagentPermissionRequired { .. } => "subagent.permission_required",
            Unknown { event_type, .. } => event_type,
        }
    }

    /// Deserialize a wire event, degrading unknown `type` values to
    /// [`AgentEvent::Unknown`] instead of failing.
    pub fn from_value(v: Value) -> AgentEvent {
        match serde_json::from_value::<AgentEvent>(v.clone()) {
            Ok(event) => event,
            Err(_) => {
                let event_type = v
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                AgentEvent::Unknown { event_type, raw: v }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
