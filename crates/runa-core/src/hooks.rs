// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use runa_model::{Message, ModelRequest};
use runa_tools::ToolOutcome;

/// Verdict of the pre-tool hook for one tool call.
#[derive(Debug, Clone)]
pub enum HookDecision {
    Continue,
    Deny { reason: String },
    Skip { mock_result: String },
    RequireApproval { reason: String },
}

/// Application callbacks around model calls and tool executions.
///
/// Every method has a no-op default so embedders implement only what they
/// need.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Runs before each model call; may rewrite the request in place.
    async fn pre_model(&self, _req: &mut ModelRequest) {}

    /// Runs after the assistant message is appended.
    async fn post_model(&self, _message: &Message) {}

    /// Gate a tool call before any policy checks run.
    async fn pre_tool(&self, _name: &str, _input: &Value) -> HookDecision {
        HookDecision::Continue
    }

    /// May replace a tool's outcome before it is recorded.
    async fn post_tool(&self, _name: &str, _outcome: &ToolOutcome) -> Option<ToolOutcome> {
        None
    }

    /// Runs after any mutation of the message log.
    async fn messages_changed(&self, _messages: &[Message]) {}
}

/// Default hook set: everything passes through.
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}
