// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use runa_events::{Bookmark, Channel, EventEnvelope};
use runa_model::Message;
use runa_tools::ToolCallRecord;

use crate::types::{AgentInfo, Snapshot, TodoSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt record for agent {agent_id}: {detail}")]
    Corrupt { agent_id: String, detail: String },
}

/// Persistence boundary for all runtime state.
///
/// Runtime-state keys (`messages`, `tool-calls`, `todos`, `meta`) are
/// last-writer-wins per key; events are append-only per agent.  Reads return
/// `None`/empty when nothing was stored.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_messages(&self, agent_id: &str, messages: &[Message])
        -> Result<(), StorageError>;
    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>, StorageError>;

    /// Records are accepted in the standard shape; reads also migrate the
    /// legacy `{callId, toolName, arguments, state:int}` shape.
    async fn save_tool_calls(
        &self,
        agent_id: &str,
        records: &[ToolCallRecord],
    ) -> Result<(), StorageError>;
    async fn load_tool_calls(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>, StorageError>;

    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<(), StorageError>;
    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>, StorageError>;

    async fn append_event(
        &self,
        agent_id: &str,
        entry: &EventEnvelope,
    ) -> Result<(), StorageError>;
    async fn read_events(
        &self,
        agent_id: &str,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Vec<EventEnvelope>, StorageError>;

    async fn save_snapshot(&self, agent_id: &str, snapshot: &Snapshot)
        -> Result<(), StorageError>;
    async fn load_snapshot(
        &self,
        agent_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<Snapshot>, StorageError>;
    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>, StorageError>;
    async fn delete_snapshot(&self, agent_id: &str, snapshot_id: &str)
        -> Result<(), StorageError>;

    async fn save_info(&self, info: &AgentInfo) -> Result<(), StorageError>;
    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>, StorageError>;

    async fn exists(&self, agent_id: &str) -> Result<bool, StorageError>;
    async fn delete(&self, agent_id: &str) -> Result<(), StorageError>;
    async fn list(&self) -> Result<Vec<String>, StorageError>;
}
