// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod context;
mod delegate;
mod error;
mod hooks;
mod permission;
mod queue;
mod repair;
mod runner;
mod scheduler;
mod skills;
mod state;
mod streamer;
mod todos;

pub use agent::{Agent, AgentDeps, ResumeStrategy, RunResult, RunStopReason};
pub use context::{CompressionResult, ContextManager};
pub use delegate::{DelegateRequest, DelegateResult, DelegateStatus};
pub use error::CoreError;
pub use hooks::{HookDecision, Hooks, NoopHooks};
pub use queue::{MessageKind, QueuedMessage, ReminderOptions, SendOptions};
pub use repair::{sanitize_orphan_tool_results, seal_dangling_tool_uses};
pub use scheduler::{Scheduler, TriggerKind};
pub use skills::{SkillPackage, SkillsManager};
pub use streamer::StreamedTurn;
