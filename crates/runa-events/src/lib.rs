// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
mod bus;
mod envelope;
mod event;

pub use bus::{EventBus, Subscription, TimelineSink};
pub use envelope::{Bookmark, EventEnvelope};
pub use event::{
    AgentEvent, Breakpoint, Channel, DoneReason, ErrorPhase, ErrorSeverity, RuntimeState,
};
