// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use chrono::Utc;
use tokio::sync::Mutex;

use runa_store::{TodoItem, TodoSnapshot};

use crate::error::CoreError;

/// Versioned todo list with the single-in-progress invariant.
pub(crate) struct TodoManager {
    snapshot: Mutex<TodoSnapshot>,
}

impl TodoManager {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(TodoSnapshot::empty()),
        }
    }

    pub async fn restore(&self, snapshot: TodoSnapshot) {
        *self.snapshot.lock().await = snapshot;
    }

    /// Replace the todo list.  Rejects input with more than one
    /// `in_progress` item; on success bumps the version.
    pub async fn set(&self, todos: Vec<TodoItem>) -> Result<TodoSnapshot, CoreError> {
        let in_progress = todos
            .iter()
            .filter(|t| t.status == runa_store::TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(CoreError::Configuration(format!(
                "todo list may contain at most one in_progress item, got {in_progress}"
            )));
        }
        let mut snapshot = self.snapshot.lock().await;
        snapshot.todos = todos;
        snapshot.version += 1;
        snapshot.updated_at = Utc::now();
        Ok(snapshot.clone())
    }

    pub async fn get(&self) -> TodoSnapshot {
        self.snapshot.lock().await.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_store::TodoStatus;

    fn todo(id: &str, status: TodoStatus) -> TodoItem {
        TodoItem {
            id: id.into(),
            title: format!("task {id}"),
            status,
        }
    }

    #[tokio::test]
    async fn set_bumps_version() {
        let mgr = TodoManager::new();
        let snap = mgr.set(vec![todo("1", TodoStatus::Pending)]).await.unwrap();
        assert_eq!(snap.version, 1);
        let snap = mgr.set(vec![todo("1", TodoStatus::Completed)]).await.unwrap();
        assert_eq!(snap.version, 2);
    }

    #[tokio::test]
    async fn one_in_progress_is_allowed() {
        let mgr = TodoManager::new();
        let snap = mgr
            .set(vec![
                todo("1", TodoStatus::InProgress),
                todo("2", TodoStatus::Pending),
            ])
            .await
            .unwrap();
        assert_eq!(snap.in_progress_count(), 1);
    }

    #[tokio::test]
    async fn two_in_progress_is_rejected_and_state_unchanged() {
        let mgr = TodoManager::new();
        mgr.set(vec![todo("1", TodoStatus::InProgress)]).await.unwrap();
        let err = mgr
            .set(vec![
                todo("1", TodoStatus::InProgress),
                todo("2", TodoStatus::InProgress),
            ])
            .await;
        assert!(err.is_err());
        let snap = mgr.get().await;
        assert_eq!(snap.version, 1);
        assert_eq!(snap.todos.len(), 1);
    }
}
