// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use serde_json::Value;
use tracing::warn;

use runa_events::{AgentEvent, EventBus};
use runa_model::{ChunkStream, ContentBlock, StopReason, StreamChunk, Usage};

/// Aggregated result of one model stream.
#[derive(Debug)]
pub struct StreamedTurn {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

struct PendingToolUse {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolUse {
    /// Always resolve to a JSON value.  An empty buffer becomes `{}`;
    /// unparseable JSON is preserved as a raw string so input validation can
    /// report the shape mismatch to the model.
    fn finish(self) -> ContentBlock {
        let input = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool_use_id = %self.id,
                        tool_name = %self.name,
                        error = %e,
                        "model sent unparseable tool arguments; passing raw text"
                    );
                    Value::String(self.args_buf)
                }
            }
        };
        ContentBlock::ToolUse {
            id: self.id,
            name: self.name,
            input,
        }
    }
}

/// Consume one provider stream, emitting chunked progress events and
/// aggregating the assistant message blocks.
///
/// Chunk framing: a contiguous text run is bracketed by
/// `text_chunk_start` / `text_chunk_end`; thinking runs likewise (emitted
/// only when `expose_thinking`).  `token_usage` lands on the monitor channel
/// when the provider reports usage at stream completion.
pub(crate) async fn consume(
    mut stream: ChunkStream,
    bus: &EventBus,
    expose_thinking: bool,
) -> anyhow::Result<StreamedTurn> {
    let mut text_buf = String::new();
    let mut think_buf = String::new();
    let mut text_open = false;
    let mut think_open = false;
    let mut pending: Vec<PendingToolUse> = Vec::new();
    let mut stop_reason = StopReason::EndTurn;
    let mut usage = Usage::default();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta(delta) => {
                if think_open {
                    bus.emit(AgentEvent::ThinkChunkEnd).await;
                    think_open = false;
                }
                if !text_open {
                    bus.emit(AgentEvent::TextChunkStart).await;
                    text_open = true;
                }
                text_buf.push_str(&delta);
                bus.emit(AgentEvent::TextChunk { text: delta }).await;
            }
            StreamChunk::ThinkingDelta(delta) => {
                if expose_thinking {
                    if text_open {
                        bus.emit(AgentEvent::TextChunkEnd).await;
                        text_open = false;
                    }
                    if !think_open {
                        bus.emit(AgentEvent::ThinkChunkStart).await;
                        think_open = true;
                    }
                    bus.emit(AgentEvent::ThinkChunk {
                        text: delta.clone(),
                    })
                    .await;
                }
                think_buf.push_str(&delta);
            }
            StreamChunk::ToolUseStart { id, name } => {
                if text_open {
                    bus.emit(AgentEvent::TextChunkEnd).await;
                    text_open = false;
                }
                if think_open {
                    bus.emit(AgentEvent::ThinkChunkEnd).await;
                    think_open = false;
                }
                pending.push(PendingToolUse {
                    id,
                    name,
                    args_buf: String::new(),
                });
            }
            StreamChunk::ToolUseInputDelta { id, delta } => {
                if let Some(p) = pending.iter_mut().find(|p| p.id == id) {
                    p.args_buf.push_str(&delta);
                } else {
                    warn!(tool_use_id = %id, "input delta for unknown tool use; dropping");
                }
            }
            StreamChunk::ToolUseComplete { .. } => {}
            StreamChunk::MessageStop {
                stop_reason: reason,
                usage: u,
            } => {
                stop_reason = reason;
                usage = u;
                break;
            }
        }
    }

    if text_open {
        bus.emit(AgentEvent::TextChunkEnd).await;
    }
    if think_open {
        bus.emit(AgentEvent::ThinkChunkEnd).await;
    }
    bus.emit(AgentEvent::TokenUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens(),
    })
    .await;

    // Assemble blocks: thinking first, then text, then tool uses in arrival
    // order — mirroring how providers lay out the assistant message.
    let mut blocks = Vec::new();
    if !think_buf.is_empty() {
        blocks.push(ContentBlock::Thinking { text: think_buf });
    }
    if !text_buf.is_empty() {
        blocks.push(ContentBlock::Text { text: text_buf });
    }
    for p in pending {
        if p.name.is_empty() {
            warn!(tool_use_id = %p.id, "dropping tool use with empty name; cannot dispatch");
            continue;
        }
        blocks.push(p.finish());
    }

    Ok(StreamedTurn {
        blocks,
        stop_reason,
        usage,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
