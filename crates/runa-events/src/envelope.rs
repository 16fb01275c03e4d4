// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Durable envelope around every published event.
//!
//! Wire form:
//! ```json
//! {"cursor":N,"bookmark":{"seq":N,"timestamp":ms},
//!  "event":{"channel":"progress","type":"...","bookmark":{...},...payload...}}
//! ```
//! `event.bookmark` is a redundant copy of the envelope bookmark for
//! consumers that only see the inner event.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::event::{AgentEvent, Channel};

/// Durable cursor into an agent's event timeline.
///
/// `seq` is monotonically non-decreasing across a bus's lifetime and is
/// seeded from stored meta on resume so it stays monotonic across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bookmark {
    pub seq: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// One persisted timeline entry.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub cursor: u64,
    pub bookmark: Bookmark,
    pub event: AgentEvent,
}

impl EventEnvelope {
    /// Inner-event wire object with `channel` and `bookmark` injected.
    fn event_value(&self) -> Value {
        let mut v = match &self.event {
            AgentEvent::Unknown { raw, .. } => raw.clone(),
            event => serde_json::to_value(event).unwrap_or(Value::Null),
        };
        if let Some(obj) = v.as_object_mut() {
            obj.entry("channel")
                .or_insert_with(|| serde_json::to_value(self.event.channel()).unwrap());
            obj.insert(
                "bookmark".into(),
                serde_json::to_value(self.bookmark).unwrap(),
            );
        }
        v
    }
}

impl Serialize for EventEnvelope {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            cursor: u64,
            bookmark: &'a Bookmark,
            event: Value,
        }
        Wire {
            cursor: self.cursor,
            bookmark: &self.bookmark,
            event: self.event_value(),
        }
        .serialize(s)
    }
}

impl<'de> Deserialize<'de> for EventEnvelope {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            cursor: u64,
            bookmark: Bookmark,
            event: Value,
        }
        let wire = Wire::deserialize(d)?;
        Ok(EventEnvelope {
            cursor: wire.cursor,
            bookmark: wire.bookmark,
            event: AgentEvent::from_value(wire.event),
        })
    }
}

impl EventEnvelope {
    pub fn channel(&self) -> Channel {
        self.event.channel()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DoneReason;

    fn envelope(seq: u64, event: AgentEvent) -> EventEnvelope {
        EventEnvelope {
            cursor: seq,
            bookmark: Bookmark {
                seq,
                timestamp: 1_700_000_000_000,
            },
            event,
        }
    }

    #[test]
    fn wire_form_has_cursor_bookmark_and_typed_event() {
        let env = envelope(
            7,
            AgentEvent::Done {
                step: 2,
                reason: DoneReason::Completed,
            },
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["cursor"], 7);
        assert_eq!(v["bookmark"]["seq"], 7);
        assert_eq!(v["event"]["type"], "done");
        assert_eq!(v["event"]["channel"], "progress");
        // Redundant inner bookmark copy.
        assert_eq!(v["event"]["bookmark"]["seq"], 7);
    }

    #[test]
    fn round_trip_preserves_known_event() {
        let env = envelope(3, AgentEvent::TextChunk { text: "hi".into() });
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cursor, 3);
        assert!(matches!(back.event, AgentEvent::TextChunk { ref text } if text == "hi"));
    }

    #[test]
    fn unknown_event_survives_round_trip_verbatim() {
        let raw = serde_json::json!({
            "type": "never_heard_of_it",
            "channel": "monitor",
            "custom": [1, 2]
        });
        let env = envelope(
            9,
            AgentEvent::Unknown {
                event_type: "never_heard_of_it".into(),
                raw: raw.clone(),
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        match back.event {
            AgentEvent::Unknown { event_type, raw } => {
                assert_eq!(event_type, "never_heard_of_it");
                assert_eq!(raw["custom"][1], 2);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn bookmarks_order_by_seq() {
        let a = Bookmark {
            seq: 1,
            timestamp: 10,
        };
        let b = Bookmark {
            seq: 2,
            timestamp: 5,
        };
        assert!(a < b);
    }
}
