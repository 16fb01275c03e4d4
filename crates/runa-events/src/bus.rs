// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::envelope::{Bookmark, EventEnvelope};
use crate::event::{AgentEvent, Channel};

/// Persistence boundary for the timeline.  Implemented by the store layer;
/// the bus never knows how envelopes are serialized.
#[async_trait]
pub trait TimelineSink: Send + Sync {
    async fn append(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
    /// Read persisted envelopes, filtered by channel and strictly after
    /// `since.seq`, in seq order.
    async fn read(
        &self,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> anyhow::Result<Vec<EventEnvelope>>;
}

/// Lazy event stream returned by [`EventBus::subscribe`].
pub type Subscription = UnboundedReceiverStream<EventEnvelope>;

struct Subscriber {
    channels: HashSet<Channel>,
    kinds: Option<HashSet<String>>,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl Subscriber {
    fn wants(&self, env: &EventEnvelope) -> bool {
        if !self.channels.contains(&env.channel()) {
            return false;
        }
        match &self.kinds {
            Some(kinds) => kinds.contains(env.event.kind()),
            None => true,
        }
    }
}

struct BusInner {
    next_seq: u64,
    last_bookmark: Option<Bookmark>,
    subscribers: Vec<Subscriber>,
    /// Envelopes whose persistence failed, retryable via `flush_failed`.
    failed: Vec<EventEnvelope>,
}

/// Per-agent event bus.
///
/// Every emit assigns a strictly increasing cursor under the bus lock, and
/// the envelope is handed to the timeline sink *before* any in-process
/// subscriber sees it.  On persistence failure the envelope is buffered in
/// memory and a monitor `storage_failure` event is emitted best-effort.
pub struct EventBus {
    sink: Arc<dyn TimelineSink>,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(sink: Arc<dyn TimelineSink>) -> Self {
        Self::with_seed(sink, None)
    }

    /// Seed the cursor from persisted meta so that `seq` stays monotonic
    /// across restarts: the first emit uses `seed.seq + 1`.
    pub fn with_seed(sink: Arc<dyn TimelineSink>, seed: Option<Bookmark>) -> Self {
        let next_seq = seed.map(|b| b.seq + 1).unwrap_or(1);
        Self {
            sink,
            inner: Mutex::new(BusInner {
                next_seq,
                last_bookmark: seed,
                subscribers: Vec::new(),
                failed: Vec::new(),
            }),
        }
    }

    /// Publish an event; returns the assigned bookmark.
    pub async fn emit(&self, event: AgentEvent) -> Bookmark {
        let mut inner = self.inner.lock().await;
        let (bookmark, persist_failed) = Self::emit_locked(&mut inner, &self.sink, event).await;
        if persist_failed {
            // Best-effort observability; if storage is still down this lands
            // in the failure buffer without another report.
            let failed_count = inner.failed.len();
            let _ = Self::emit_locked(
                &mut inner,
                &self.sink,
                AgentEvent::StorageFailure {
                    message: "event persistence failed; envelope buffered".into(),
                    failed_count,
                },
            )
            .await;
        }
        bookmark
    }

    async fn emit_locked(
        inner: &mut BusInner,
        sink: &Arc<dyn TimelineSink>,
        event: AgentEvent,
    ) -> (Bookmark, bool) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let bookmark = Bookmark {
            seq,
            timestamp: Utc::now().timestamp_millis(),
        };
        let envelope = EventEnvelope {
            cursor: seq,
            bookmark,
            event,
        };
        inner.last_bookmark = Some(bookmark);

        let persist_failed = match sink.append(&envelope).await {
            Ok(()) => false,
            Err(e) => {
                warn!(seq, error = %e, "event persistence failed; buffering envelope");
                inner.failed.push(envelope.clone());
                true
            }
        };

        inner.subscribers.retain(|s| !s.tx.is_closed());
        for sub in &inner.subscribers {
            if sub.wants(&envelope) {
                let _ = sub.tx.send(envelope.clone());
            }
        }
        (bookmark, persist_failed)
    }

    /// Subscribe to `channels`, optionally replaying history.
    ///
    /// With `since = None` no history is replayed — only events emitted after
    /// this call are delivered.  With `since = Some(b)` all persisted events
    /// with `seq > b.seq` are replayed in order before live delivery begins;
    /// registration happens under the bus lock so no event is lost or
    /// duplicated in between.
    pub async fn subscribe(
        &self,
        channels: &[Channel],
        since: Option<Bookmark>,
        kinds: Option<HashSet<String>>,
    ) -> Subscription {
        let channels: HashSet<Channel> = channels.iter().copied().collect();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().await;
        if since.is_some() {
            let replay = self
                .sink
                .read(None, since)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "timeline replay failed; subscription starts live-only");
                    Vec::new()
                });
            for env in replay {
                let matches_kind = kinds
                    .as_ref()
                    .map(|k| k.contains(env.event.kind()))
                    .unwrap_or(true);
                if channels.contains(&env.channel()) && matches_kind {
                    let _ = tx.send(env);
                }
            }
        }
        inner.subscribers.push(Subscriber {
            channels,
            kinds,
            tx,
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Number of envelopes currently buffered due to persistence failure.
    pub async fn failed_event_count(&self) -> usize {
        self.inner.lock().await.failed.len()
    }

    /// Retry persistence of buffered envelopes, in order.  Stops at the
    /// first failure; returns the number flushed.
    pub async fn flush_failed(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut flushed = 0;
        while let Some(env) = inner.failed.first().cloned() {
            match self.sink.append(&env).await {
                Ok(()) => {
                    inner.failed.remove(0);
                    flushed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "flush of buffered events stalled");
                    break;
                }
            }
        }
        flushed
    }

    /// Bookmark of the most recently emitted event (or the seed).
    pub async fn last_bookmark(&self) -> Option<Bookmark> {
        self.inner.lock().await.last_bookmark
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
