// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use runa_events::{Bookmark, Channel, EventEnvelope, TimelineSink};

use crate::store::Store;

/// Adapts one agent's slice of a [`Store`] to the bus's [`TimelineSink`].
pub struct AgentTimeline {
    store: Arc<dyn Store>,
    agent_id: String,
}

impl AgentTimeline {
    pub fn new(store: Arc<dyn Store>, agent_id: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl TimelineSink for AgentTimeline {
    async fn append(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self.store.append_event(&self.agent_id, envelope).await?;
        Ok(())
    }

    async fn read(
        &self,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        Ok(self.store.read_events(&self.agent_id, channel, since).await?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use runa_events::{AgentEvent, EventBus};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn bus_persists_through_store_timeline() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(Arc::new(AgentTimeline::new(store.clone(), "a1")));
        bus.emit(AgentEvent::TextChunk { text: "x".into() }).await;

        let events = store.read_events("a1", None, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cursor, 1);
    }

    #[tokio::test]
    async fn replay_after_restart_with_seed() {
        let store = Arc::new(MemoryStore::new());
        let first = EventBus::new(Arc::new(AgentTimeline::new(store.clone(), "a1")));
        first.emit(AgentEvent::TextChunk { text: "one".into() }).await;
        let last = first.last_bookmark().await.unwrap();

        // Restart: a new bus seeded from the persisted bookmark.
        let second = EventBus::with_seed(
            Arc::new(AgentTimeline::new(store.clone(), "a1")),
            Some(last),
        );
        let mut sub = second
            .subscribe(
                &[runa_events::Channel::Progress],
                Some(Bookmark {
                    seq: 0,
                    timestamp: 0,
                }),
                None,
            )
            .await;
        second
            .emit(AgentEvent::TextChunk { text: "two".into() })
            .await;

        let replayed = sub.next().await.unwrap();
        assert_eq!(replayed.bookmark.seq, 1);
        let live = sub.next().await.unwrap();
        assert_eq!(live.bookmark.seq, 2, "combined sequence stays monotonic");
    }
}
