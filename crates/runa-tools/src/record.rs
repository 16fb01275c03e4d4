// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Lifecycle state of a tool call.
///
/// Terminal states (`Completed | Failed | Denied | Sealed`) are immutable —
/// late completions arriving after a seal are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallState {
    Pending,
    ApprovalRequired,
    Approved,
    Executing,
    Completed,
    Failed,
    Denied,
    Sealed,
}

impl ToolCallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolCallState::Completed
                | ToolCallState::Failed
                | ToolCallState::Denied
                | ToolCallState::Sealed
        )
    }

    /// Legacy stores persisted this enum as an integer.
    fn from_index(n: u64) -> Option<Self> {
        Some(match n {
            0 => ToolCallState::Pending,
            1 => ToolCallState::ApprovalRequired,
            2 => ToolCallState::Approved,
            3 => ToolCallState::Executing,
            4 => ToolCallState::Completed,
            5 => ToolCallState::Failed,
            6 => ToolCallState::Denied,
            7 => ToolCallState::Sealed,
            _ => return None,
        })
    }
}

impl<'de> Deserialize<'de> for ToolCallState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        if let Some(n) = v.as_u64() {
            return ToolCallState::from_index(n)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown tool-call state {n}")));
        }
        let s = v
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("tool-call state must be string or int"))?;
        Ok(match s {
            "PENDING" => ToolCallState::Pending,
            "APPROVAL_REQUIRED" => ToolCallState::ApprovalRequired,
            "APPROVED" => ToolCallState::Approved,
            "EXECUTING" => ToolCallState::Executing,
            "COMPLETED" => ToolCallState::Completed,
            "FAILED" => ToolCallState::Failed,
            "DENIED" => ToolCallState::Denied,
            "SEALED" => ToolCallState::Sealed,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown tool-call state {other:?}"
                )))
            }
        })
    }
}

impl std::fmt::Display for ToolCallState {
    /// Wire form: uppercase snake case, matching the serde representation.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCallState::Pending => "PENDING",
            ToolCallState::ApprovalRequired => "APPROVAL_REQUIRED",
            ToolCallState::Approved => "APPROVED",
            ToolCallState::Executing => "EXECUTING",
            ToolCallState::Completed => "COMPLETED",
            ToolCallState::Failed => "FAILED",
            ToolCallState::Denied => "DENIED",
            ToolCallState::Sealed => "SEALED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

/// Approval bookkeeping attached to a tool-call record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// One entry in a record's audit trail.  Every state transition appends one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub state: ToolCallState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The authoritative per-call state machine object, distinct from the
/// in-message tool-use / tool-result blocks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub state: ToolCallState,
    pub approval: Approval,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub audit_trail: Vec<AuditEntry>,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            input,
            state: ToolCallState::Pending,
            approval: Approval::default(),
            result: None,
            error: None,
            is_error: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            duration_ms: None,
            audit_trail: vec![AuditEntry {
                state: ToolCallState::Pending,
                timestamp: now,
                note: None,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transition to `state`, appending an audit entry.
    ///
    /// Returns `false` (and leaves the record untouched) when the record is
    /// already in a terminal state — terminal states never regress.
    pub fn transition(&mut self, state: ToolCallState, note: Option<String>) -> bool {
        if self.state.is_terminal() {
            warn!(
                call_id = %self.id,
                current = %self.state,
                requested = %state,
                "dropping transition on terminal tool-call record"
            );
            return false;
        }
        let now = Utc::now();
        if state == ToolCallState::Executing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if state.is_terminal() {
            self.completed_at = Some(now);
            let base = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - base).num_milliseconds().max(0) as u64);
        }
        self.state = state;
        self.updated_at = now;
        self.audit_trail.push(AuditEntry {
            state,
            timestamp: now,
            note,
        });
        true
    }

    /// Record a successful completion.
    pub fn complete(&mut self, result: String) -> bool {
        if !self.transition(ToolCallState::Completed, None) {
            return false;
        }
        self.result = Some(result);
        self.is_error = false;
        true
    }

    /// Record a failure with an error message.
    pub fn fail(&mut self, error: String, note: Option<String>) -> bool {
        if !self.transition(ToolCallState::Failed, note) {
            return false;
        }
        self.error = Some(error);
        self.is_error = true;
        true
    }

    /// Record a denial (policy, hook, or human decision).
    pub fn deny(&mut self, reason: String) -> bool {
        if !self.transition(ToolCallState::Denied, Some(reason.clone())) {
            return false;
        }
        self.error = Some(reason);
        self.is_error = true;
        true
    }

    /// Seal a non-terminal record with a structured reason payload (interrupt
    /// or crash recovery).  Returns the seal payload on success.
    pub fn seal(&mut self, note: &str) -> Option<Value> {
        let previous = self.state;
        if !self.transition(ToolCallState::Sealed, Some(note.to_string())) {
            return None;
        }
        let payload = serde_json::json!({
            "status": previous.to_string(),
            "note": note,
            "toolId": self.id,
        });
        self.error = Some(payload.to_string());
        self.is_error = true;
        Some(payload)
    }
}

/// Standard wire shape, with serde defaults so partially-written records
/// still load.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordWire {
    id: String,
    name: String,
    #[serde(default)]
    input: Value,
    state: ToolCallState,
    #[serde(default)]
    approval: Approval,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    is_error: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    audit_trail: Vec<AuditEntry>,
}

/// Legacy persisted shape: `{callId, toolName, arguments, state:int}`.
#[derive(Deserialize)]
struct LegacyRecordWire {
    #[serde(rename = "callId")]
    call_id: String,
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    state: ToolCallState,
}

impl<'de> Deserialize<'de> for ToolCallRecord {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        if v.get("callId").is_some() {
            let legacy = LegacyRecordWire::deserialize(&v).map_err(serde::de::Error::custom)?;
            let now = Utc::now();
            let mut record = ToolCallRecord::new(legacy.call_id, legacy.tool_name, legacy.arguments);
            record.state = legacy.state;
            record.is_error = matches!(
                legacy.state,
                ToolCallState::Failed | ToolCallState::Denied | ToolCallState::Sealed
            );
            record.audit_trail = vec![AuditEntry {
                state: legacy.state,
                timestamp: now,
                note: Some("migrated from legacy record".into()),
            }];
            return Ok(record);
        }
        let wire = RecordWire::deserialize(&v).map_err(serde::de::Error::custom)?;
        Ok(ToolCallRecord {
            id: wire.id,
            name: wire.name,
            input: wire.input,
            state: wire.state,
            approval: wire.approval,
            result: wire.result,
            error: wire.error,
            is_error: wire.is_error,
            created_at: wire.created_at,
            started_at: wire.started_at,
            completed_at: wire.completed_at,
            updated_at: wire.updated_at,
            duration_ms: wire.duration_ms,
            audit_trail: wire.audit_trail,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ToolCallRecord {
        ToolCallRecord::new("c1", "fs_read", json!({"path": "a.txt"}))
    }

    // ── State machine ─────────────────────────────────────────────────────────

    #[test]
    fn new_record_is_pending_with_one_audit_entry() {
        let r = record();
        assert_eq!(r.state, ToolCallState::Pending);
        assert_eq!(r.audit_trail.len(), 1);
    }

    #[test]
    fn every_transition_appends_audit() {
        let mut r = record();
        r.transition(ToolCallState::Approved, None);
        r.transition(ToolCallState::Executing, None);
        assert_eq!(r.audit_trail.len(), 3);
        assert_eq!(r.audit_trail.last().unwrap().state, ToolCallState::Executing);
    }

    #[test]
    fn terminal_states_never_regress() {
        let mut r = record();
        assert!(r.complete("done".into()));
        assert!(!r.transition(ToolCallState::Executing, None));
        assert!(!r.fail("late".into(), None));
        assert_eq!(r.state, ToolCallState::Completed);
        assert_eq!(r.result.as_deref(), Some("done"));
    }

    #[test]
    fn late_completion_after_seal_is_dropped() {
        let mut r = record();
        r.transition(ToolCallState::Executing, None);
        assert!(r.seal("Sealed during crash recovery").is_some());
        assert!(!r.complete("too late".into()));
        assert_eq!(r.state, ToolCallState::Sealed);
    }

    #[test]
    fn seal_payload_carries_previous_state() {
        let mut r = record();
        r.transition(ToolCallState::Executing, None);
        let payload = r.seal("Sealed during crash recovery").unwrap();
        assert_eq!(payload["status"], "EXECUTING");
        assert_eq!(payload["toolId"], "c1");
        assert_eq!(payload["note"], "Sealed during crash recovery");
    }

    #[test]
    fn executing_sets_started_at_and_terminal_sets_duration() {
        let mut r = record();
        r.transition(ToolCallState::Executing, None);
        assert!(r.started_at.is_some());
        r.complete("ok".into());
        assert!(r.completed_at.is_some());
        assert!(r.duration_ms.is_some());
    }

    // ── Fuzzed transition sequences ───────────────────────────────────────────

    #[test]
    fn arbitrary_transition_sequences_never_leave_terminal() {
        let states = [
            ToolCallState::Pending,
            ToolCallState::ApprovalRequired,
            ToolCallState::Approved,
            ToolCallState::Executing,
            ToolCallState::Completed,
            ToolCallState::Failed,
            ToolCallState::Denied,
            ToolCallState::Sealed,
        ];
        // Deterministic pseudo-random walk over all pairs.
        for seed in 0..64u64 {
            let mut r = record();
            let mut terminal_state = None;
            let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            for _ in 0..16 {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let next = states[(x >> 33) as usize % states.len()];
                let accepted = r.transition(next, None);
                match terminal_state {
                    Some(t) => {
                        assert!(!accepted, "transition accepted on terminal record");
                        assert_eq!(r.state, t);
                    }
                    None => {
                        if accepted && next.is_terminal() {
                            terminal_state = Some(next);
                        }
                    }
                }
            }
        }
    }

    // ── Serde ─────────────────────────────────────────────────────────────────

    #[test]
    fn state_serialises_uppercase() {
        assert_eq!(
            serde_json::to_string(&ToolCallState::ApprovalRequired).unwrap(),
            "\"APPROVAL_REQUIRED\""
        );
    }

    #[test]
    fn state_accepts_legacy_integer() {
        let s: ToolCallState = serde_json::from_str("3").unwrap();
        assert_eq!(s, ToolCallState::Executing);
    }

    #[test]
    fn record_wire_uses_camel_case_keys() {
        let r = record();
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("createdAt").is_some());
        assert!(v.get("updatedAt").is_some());
        assert!(v.get("auditTrail").is_some());
        assert!(v.get("isError").is_some());
    }

    #[test]
    fn record_round_trips() {
        let mut r = record();
        r.transition(ToolCallState::Executing, Some("go".into()));
        r.complete("done".into());
        let json = serde_json::to_string(&r).unwrap();
        let back: ToolCallRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "c1");
        assert_eq!(back.state, ToolCallState::Completed);
        assert_eq!(back.audit_trail.len(), 3);
    }

    #[test]
    fn legacy_record_shape_migrates() {
        let json = r#"{"callId":"old-1","toolName":"bash","arguments":{"cmd":"ls"},"state":5}"#;
        let r: ToolCallRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.id, "old-1");
        assert_eq!(r.name, "bash");
        assert_eq!(r.state, ToolCallState::Failed);
        assert!(r.is_error);
        assert_eq!(r.input["cmd"], "ls");
    }
}
