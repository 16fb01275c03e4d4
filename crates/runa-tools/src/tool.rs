// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access class a tool declares for permission decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolAccess {
    Read,
    Write,
    Execute,
}

/// Static metadata a tool declares about its side effects.
///
/// `access == None` means the tool made no declaration; readonly mode
/// treats that as ambiguous and asks for approval.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ToolMeta {
    #[serde(default)]
    pub access: Option<ToolAccess>,
    #[serde(default)]
    pub mutates: bool,
}

impl ToolMeta {
    pub fn read_only() -> Self {
        Self {
            access: Some(ToolAccess::Read),
            mutates: false,
        }
    }

    pub fn mutating(access: ToolAccess) -> Self {
        Self {
            access: Some(access),
            mutates: true,
        }
    }
}

/// Serializable identity of a tool, persisted inside agent meta so a resumed
/// agent can re-create its tool set from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// The result of executing a tool.
///
/// Tool failures are never fatal to the agent: they are recorded on the
/// tool-call record and surfaced to the model as an error tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    /// Successful result with a JSON value payload.
    pub fn ok(value: impl Into<Value>) -> Self {
        Self {
            success: true,
            value: Some(value.into()),
            error: None,
        }
    }

    /// Successful plain-text result.
    pub fn ok_text(text: impl Into<String>) -> Self {
        Self::ok(Value::String(text.into()))
    }

    /// Error result containing a plain-text message.
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(msg.into()),
        }
    }

    /// Plain-text rendering used as tool-result block content.
    pub fn content(&self) -> String {
        if let Some(err) = &self.error {
            return err.clone();
        }
        match &self.value {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }
}

/// Isolated execution environment owned by exactly one agent and disposed
/// with it.  Concrete backends (local dir, container) live outside the core.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn working_dir(&self) -> &Path;
    async fn read_file(&self, path: &Path) -> anyhow::Result<String>;
    async fn write_file(&self, path: &Path, content: &str) -> anyhow::Result<()>;
    async fn exec(&self, command: &str) -> anyhow::Result<String>;
}

/// Per-invocation context handed to a tool.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub sandbox: Option<Arc<dyn Sandbox>>,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }
}

/// Trait that every tool offered to an agent must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    /// Side-effect declaration used by readonly-mode gating.
    fn meta(&self) -> ToolMeta {
        ToolMeta::default()
    }
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            registry_id: None,
            config: None,
        }
    }
    /// Optional extra prompt text injected when the tool is exposed.
    async fn prompt(&self, _ctx: &ToolContext) -> Option<String> {
        None
    }
    /// Execute the tool.  Failures should be wrapped in [`ToolOutcome::err`].
    async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolOutcome;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
