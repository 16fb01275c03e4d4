// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use runa_events::{Bookmark, Channel, EventEnvelope};
use runa_model::Message;
use runa_tools::ToolCallRecord;

use crate::store::{StorageError, Store};
use crate::types::{AgentInfo, Snapshot, TodoSnapshot};

/// In-memory reference store.
///
/// Everything is held as serialized JSON values so reads exercise the same
/// wire paths (legacy enum values, unknown event types) as a real backend.
#[derive(Default)]
pub struct MemoryStore {
    agents: Mutex<HashMap<String, AgentRecord>>,
}

#[derive(Default)]
struct AgentRecord {
    messages: Option<Value>,
    tool_calls: Option<Value>,
    todos: Option<Value>,
    info: Option<Value>,
    events: Vec<Value>,
    snapshots: Vec<Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Value, StorageError> {
        serde_json::to_value(value).map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(
        agent_id: &str,
        value: &Value,
    ) -> Result<T, StorageError> {
        serde_json::from_value(value.clone()).map_err(|e| StorageError::Corrupt {
            agent_id: agent_id.to_string(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_messages(
        &self,
        agent_id: &str,
        messages: &[Message],
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().messages =
            Some(Self::encode(&messages)?);
        Ok(())
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>, StorageError> {
        let agents = self.agents.lock().await;
        match agents.get(agent_id).and_then(|a| a.messages.as_ref()) {
            Some(v) => Self::decode(agent_id, v),
            None => Ok(Vec::new()),
        }
    }

    async fn save_tool_calls(
        &self,
        agent_id: &str,
        records: &[ToolCallRecord],
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().tool_calls =
            Some(Self::encode(&records)?);
        Ok(())
    }

    async fn load_tool_calls(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>, StorageError> {
        let agents = self.agents.lock().await;
        match agents.get(agent_id).and_then(|a| a.tool_calls.as_ref()) {
            Some(v) => Self::decode(agent_id, v),
            None => Ok(Vec::new()),
        }
    }

    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().todos = Some(Self::encode(todos)?);
        Ok(())
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>, StorageError> {
        let agents = self.agents.lock().await;
        agents
            .get(agent_id)
            .and_then(|a| a.todos.as_ref())
            .map(|v| Self::decode(agent_id, v))
            .transpose()
    }

    async fn append_event(
        &self,
        agent_id: &str,
        entry: &EventEnvelope,
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        agents
            .entry(agent_id.to_string())
            .or_default()
            .events
            .push(Self::encode(entry)?);
        Ok(())
    }

    async fn read_events(
        &self,
        agent_id: &str,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        let agents = self.agents.lock().await;
        let Some(agent) = agents.get(agent_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for v in &agent.events {
            let env: EventEnvelope = Self::decode(agent_id, v)?;
            if let Some(c) = channel {
                if env.channel() != c {
                    continue;
                }
            }
            if let Some(b) = since {
                if env.bookmark.seq <= b.seq {
                    continue;
                }
            }
            out.push(env);
        }
        Ok(out)
    }

    async fn save_snapshot(
        &self,
        agent_id: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        let agent = agents.entry(agent_id.to_string()).or_default();
        agent
            .snapshots
            .retain(|v| v.get("id").and_then(|i| i.as_str()) != Some(snapshot.id.as_str()));
        agent.snapshots.push(Self::encode(snapshot)?);
        Ok(())
    }

    async fn load_snapshot(
        &self,
        agent_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<Snapshot>, StorageError> {
        let agents = self.agents.lock().await;
        agents
            .get(agent_id)
            .and_then(|a| {
                a.snapshots
                    .iter()
                    .find(|v| v.get("id").and_then(|i| i.as_str()) == Some(snapshot_id))
            })
            .map(|v| Self::decode(agent_id, v))
            .transpose()
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>, StorageError> {
        let agents = self.agents.lock().await;
        let Some(agent) = agents.get(agent_id) else {
            return Ok(Vec::new());
        };
        agent
            .snapshots
            .iter()
            .map(|v| Self::decode(agent_id, v))
            .collect()
    }

    async fn delete_snapshot(
        &self,
        agent_id: &str,
        snapshot_id: &str,
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent
                .snapshots
                .retain(|v| v.get("id").and_then(|i| i.as_str()) != Some(snapshot_id));
        }
        Ok(())
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<(), StorageError> {
        let mut agents = self.agents.lock().await;
        agents.entry(info.agent_id.clone()).or_default().info = Some(Self::encode(info)?);
        Ok(())
    }

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>, StorageError> {
        let agents = self.agents.lock().await;
        agents
            .get(agent_id)
            .and_then(|a| a.info.as_ref())
            .map(|v| Self::decode(agent_id, v))
            .transpose()
    }

    async fn exists(&self, agent_id: &str) -> Result<bool, StorageError> {
        Ok(self.agents.lock().await.contains_key(agent_id))
    }

    async fn delete(&self, agent_id: &str) -> Result<(), StorageError> {
        self.agents.lock().await.remove(agent_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.agents.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_events::AgentEvent;
    use runa_model::Message;

    #[tokio::test]
    async fn messages_round_trip() {
        let store = MemoryStore::new();
        let msgs = vec![Message::user("hi"), Message::assistant("hello")];
        store.save_messages("a1", &msgs).await.unwrap();
        let loaded = store.load_messages("a1").await.unwrap();
        assert_eq!(loaded, msgs);
    }

    #[tokio::test]
    async fn absent_agent_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.load_messages("ghost").await.unwrap().is_empty());
        assert!(store.load_info("ghost").await.unwrap().is_none());
        assert!(store.load_todos("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn info_save_load_round_trip() {
        let store = MemoryStore::new();
        let mut info = AgentInfo::new("a1");
        info.message_count = 4;
        store.save_info(&info).await.unwrap();
        let back = store.load_info("a1").await.unwrap().unwrap();
        assert_eq!(back.message_count, 4);
        assert_eq!(back.agent_id, "a1");
    }

    #[tokio::test]
    async fn events_filter_by_channel_and_since() {
        let store = MemoryStore::new();
        for seq in 1..=3u64 {
            let env = EventEnvelope {
                cursor: seq,
                bookmark: Bookmark { seq, timestamp: 0 },
                event: if seq == 2 {
                    AgentEvent::StepComplete {
                        step: 1,
                        duration_ms: 1,
                    }
                } else {
                    AgentEvent::TextChunk {
                        text: seq.to_string(),
                    }
                },
            };
            store.append_event("a1", &env).await.unwrap();
        }
        let monitor = store
            .read_events("a1", Some(Channel::Monitor), None)
            .await
            .unwrap();
        assert_eq!(monitor.len(), 1);
        let late = store
            .read_events("a1", None, Some(Bookmark { seq: 2, timestamp: 0 }))
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].bookmark.seq, 3);
    }

    #[tokio::test]
    async fn legacy_tool_call_rows_migrate_on_read() {
        let store = MemoryStore::new();
        // Simulate a legacy writer by injecting the old shape directly.
        {
            let mut agents = store.agents.lock().await;
            agents.entry("a1".into()).or_default().tool_calls = Some(serde_json::json!([
                {"callId": "c9", "toolName": "bash", "arguments": {}, "state": 4}
            ]));
        }
        let records = store.load_tool_calls("a1").await.unwrap();
        assert_eq!(records[0].id, "c9");
        assert_eq!(records[0].state, runa_tools::ToolCallState::Completed);
    }

    #[tokio::test]
    async fn snapshot_lifecycle() {
        let store = MemoryStore::new();
        let snap = Snapshot {
            id: "s1".into(),
            messages: vec![Message::user("x")],
            last_sfp_index: 0,
            last_bookmark: None,
            created_at: chrono::Utc::now(),
            metadata: serde_json::Map::new(),
        };
        store.save_snapshot("a1", &snap).await.unwrap();
        assert!(store.load_snapshot("a1", "s1").await.unwrap().is_some());
        assert_eq!(store.list_snapshots("a1").await.unwrap().len(), 1);
        store.delete_snapshot("a1", "s1").await.unwrap();
        assert!(store.load_snapshot("a1", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_agent() {
        let store = MemoryStore::new();
        store.save_messages("a1", &[Message::user("x")]).await.unwrap();
        assert!(store.exists("a1").await.unwrap());
        store.delete("a1").await.unwrap();
        assert!(!store.exists("a1").await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 0);
    }
}
