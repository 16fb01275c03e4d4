// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use runa_events::{AgentEvent, Breakpoint, EventBus, RuntimeState};

/// Holds the two orthogonal lifecycle states and emits monitor events on
/// every transition.  Same-state transitions are no-ops.
pub(crate) struct StateCell {
    bus: Arc<EventBus>,
    state: Mutex<RuntimeState>,
    breakpoint: Mutex<Breakpoint>,
}

impl StateCell {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: Mutex::new(RuntimeState::Ready),
            breakpoint: Mutex::new(Breakpoint::Ready),
        }
    }

    pub async fn state(&self) -> RuntimeState {
        *self.state.lock().await
    }

    pub async fn breakpoint(&self) -> Breakpoint {
        *self.breakpoint.lock().await
    }

    /// Restore the breakpoint from persisted meta without emitting.
    pub async fn restore_breakpoint(&self, bp: Breakpoint) {
        *self.breakpoint.lock().await = bp;
    }

    pub async fn set_state(&self, to: RuntimeState) {
        let from = {
            let mut state = self.state.lock().await;
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        debug!(?from, ?to, "runtime state transition");
        self.bus.emit(AgentEvent::StateChanged { from, to }).await;
    }

    pub async fn set_breakpoint(&self, to: Breakpoint) {
        let from = {
            let mut bp = self.breakpoint.lock().await;
            let from = *bp;
            if from == to {
                return;
            }
            *bp = to;
            from
        };
        self.bus
            .emit(AgentEvent::BreakpointChanged { from, to })
            .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use runa_events::{Channel, TimelineSink};

    struct NullSink;

    #[async_trait::async_trait]
    impl TimelineSink for NullSink {
        async fn append(&self, _e: &runa_events::EventEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
        async fn read(
            &self,
            _c: Option<Channel>,
            _s: Option<runa_events::Bookmark>,
        ) -> anyhow::Result<Vec<runa_events::EventEnvelope>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn transition_emits_state_changed() {
        let bus = Arc::new(EventBus::new(Arc::new(NullSink)));
        let cell = StateCell::new(bus.clone());
        let mut sub = bus.subscribe(&[Channel::Monitor], None, None).await;

        cell.set_state(RuntimeState::Working).await;
        let env = sub.next().await.unwrap();
        assert!(matches!(
            env.event,
            AgentEvent::StateChanged {
                from: RuntimeState::Ready,
                to: RuntimeState::Working
            }
        ));
    }

    #[tokio::test]
    async fn same_state_transition_is_noop() {
        let bus = Arc::new(EventBus::new(Arc::new(NullSink)));
        let cell = StateCell::new(bus.clone());
        cell.set_state(RuntimeState::Ready).await;
        assert!(bus.last_bookmark().await.is_none(), "no event emitted");
    }

    #[tokio::test]
    async fn breakpoint_transition_emits() {
        let bus = Arc::new(EventBus::new(Arc::new(NullSink)));
        let cell = StateCell::new(bus.clone());
        let mut sub = bus.subscribe(&[Channel::Monitor], None, None).await;
        cell.set_breakpoint(Breakpoint::PreModel).await;
        let env = sub.next().await.unwrap();
        assert!(matches!(
            env.event,
            AgentEvent::BreakpointChanged {
                to: Breakpoint::PreModel,
                ..
            }
        ));
        assert_eq!(cell.breakpoint().await, Breakpoint::PreModel);
    }
}
