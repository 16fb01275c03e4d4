// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Defensive message-history repair.
//!
//! Providers reject histories where a tool use has no result or a result has
//! no use.  Both passes run before every model call and after compression,
//! and both are idempotent.

use std::collections::HashSet;

use serde_json::Value;

use runa_model::{ContentBlock, Message, Role};
use runa_tools::ToolCallRecord;

const ORPHAN_CONTENT_CAP: usize = 1400;

/// Seal every assistant `ToolUse` lacking a matching `ToolResult`.
///
/// For each dangling use, the corresponding tool-call record transitions to
/// `SEALED` (a record is created first when history is corrupt and none
/// exists), and one synthesized user message is appended carrying an error
/// `ToolResult` per sealed use.  Returns the sealed record snapshots.
pub fn seal_dangling_tool_uses(
    messages: &mut Vec<Message>,
    records: &mut Vec<ToolCallRecord>,
    note: &str,
) -> Vec<ToolCallRecord> {
    let resolved: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect();

    let mut sealed = Vec::new();
    let mut result_blocks = Vec::new();
    for message in messages.iter().filter(|m| m.role == Role::Assistant) {
        for block in &message.content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            if resolved.contains(id) {
                continue;
            }
            let idx = match records.iter().position(|r| r.id == *id) {
                Some(idx) => idx,
                None => {
                    records.push(ToolCallRecord::new(id.clone(), name.clone(), input.clone()));
                    records.len() - 1
                }
            };
            let record = &mut records[idx];
            let Some(payload) = record.seal(note) else {
                // Already terminal; the matching synthetic result must exist
                // from an earlier pass — nothing to do.
                continue;
            };
            result_blocks.push(ContentBlock::tool_result(
                id.clone(),
                payload.to_string(),
                true,
            ));
            sealed.push(record.clone());
        }
    }

    if !result_blocks.is_empty() {
        messages.push(Message::user_blocks(result_blocks));
    }
    sealed
}

/// Demote every user `ToolResult` without a preceding matching `ToolUse` to
/// a plain text block.  Returns the number of blocks converted.
pub fn sanitize_orphan_tool_results(messages: &mut [Message]) -> usize {
    let mut seen_uses: HashSet<String> = HashSet::new();
    let mut converted = 0;

    for message in messages.iter_mut() {
        if message.role == Role::Assistant {
            for block in &message.content {
                if let ContentBlock::ToolUse { id, .. } = block {
                    seen_uses.insert(id.clone());
                }
            }
            continue;
        }
        if message.role != Role::User {
            continue;
        }
        for block in message.content.iter_mut() {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                continue;
            };
            if seen_uses.contains(tool_use_id) {
                continue;
            }
            let marker = if *is_error { " (error)" } else { "" };
            let snippet: String = content.chars().take(ORPHAN_CONTENT_CAP).collect();
            *block = ContentBlock::text(format!(
                "[tool_result orphaned] tool_use_id={tool_use_id}{marker}\n{snippet}"
            ));
            converted += 1;
        }
    }
    converted
}

/// Seal payload shape shared with crash recovery, exposed for tests.
pub(crate) fn seal_payloads(sealed: &[ToolCallRecord]) -> Vec<Value> {
    sealed
        .iter()
        .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
