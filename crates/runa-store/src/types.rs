// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runa_events::{Bookmark, Breakpoint};
use runa_model::Message;

/// Persisted agent metadata.
///
/// `metadata` carries a full serialized snapshot of the effective config so
/// an agent is resumable from this record alone.  The map is opaque at the
/// core boundary — tolerant reads keep forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Parent agent ids, outermost first.  Children refer to parents only by
    /// id — never by pointer.
    #[serde(default)]
    pub lineage: Vec<String>,
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub last_sfp_index: Option<usize>,
    #[serde(default)]
    pub last_bookmark: Option<Bookmark>,
    pub breakpoint: Breakpoint,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            template_id: None,
            created_at: Utc::now(),
            lineage: Vec::new(),
            config_version: 1,
            message_count: 0,
            last_sfp_index: None,
            last_bookmark: None,
            breakpoint: Breakpoint::Ready,
            metadata: serde_json::Map::new(),
        }
    }

    // Typed accessors for the opaque metadata blob, used on the resume path.

    pub fn read_string(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn read_int(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }

    pub fn read_object<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.metadata
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A stored safe-fork-point: enough message history to start a coherent
/// child agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub messages: Vec<Message>,
    pub last_sfp_index: usize,
    #[serde(default)]
    pub last_bookmark: Option<Bookmark>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

// ─── Todos ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub title: String,
    pub status: TodoStatus,
}

/// Versioned todo list; the runtime enforces at most one `InProgress` item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoSnapshot {
    pub todos: Vec<TodoItem>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TodoSnapshot {
    pub fn empty() -> Self {
        Self {
            todos: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn in_progress_count(&self) -> usize {
        self.todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_round_trips() {
        let mut info = AgentInfo::new("a1");
        info.lineage = vec!["root".into()];
        info.last_bookmark = Some(Bookmark {
            seq: 9,
            timestamp: 100,
        });
        info.metadata
            .insert("config".into(), serde_json::json!({"model": "m"}));
        let json = serde_json::to_string(&info).unwrap();
        let back: AgentInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, "a1");
        assert_eq!(back.lineage, vec!["root".to_string()]);
        assert_eq!(back.last_bookmark.unwrap().seq, 9);
        assert_eq!(back.read_object::<Value>("config").unwrap()["model"], "m");
    }

    #[test]
    fn breakpoint_reads_legacy_integer() {
        let json = r#"{"agentId":"a1","createdAt":"2026-01-01T00:00:00Z","breakpoint":6}"#;
        let info: AgentInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.breakpoint, Breakpoint::ToolExecuting);
    }

    #[test]
    fn info_wire_uses_camel_case_keys() {
        let info = AgentInfo::new("a1");
        let v = serde_json::to_value(&info).unwrap();
        assert!(v.get("agentId").is_some());
        assert!(v.get("messageCount").is_some());
        assert!(v.get("configVersion").is_some());
    }

    #[test]
    fn typed_metadata_accessors() {
        let mut info = AgentInfo::new("a1");
        info.metadata.insert("name".into(), "runa".into());
        info.metadata.insert("steps".into(), 7.into());
        assert_eq!(info.read_string("name"), Some("runa"));
        assert_eq!(info.read_int("steps"), Some(7));
        assert_eq!(info.read_string("missing"), None);
    }

    #[test]
    fn todo_in_progress_count() {
        let snap = TodoSnapshot {
            todos: vec![
                TodoItem {
                    id: "1".into(),
                    title: "a".into(),
                    status: TodoStatus::InProgress,
                },
                TodoItem {
                    id: "2".into(),
                    title: "b".into(),
                    status: TodoStatus::Pending,
                },
            ],
            version: 1,
            updated_at: Utc::now(),
        };
        assert_eq!(snap.in_progress_count(), 1);
    }
}
