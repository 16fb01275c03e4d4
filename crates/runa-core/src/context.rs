// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use futures::StreamExt;
use tracing::warn;

use runa_config::ContextConfig;
use runa_model::{ContentBlock, Message, ModelProvider, ModelRequest, Role, StreamChunk};

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, tool outputs, and constraints that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Result of one successful compression.
#[derive(Debug)]
pub struct CompressionResult {
    /// Synthesized user message inserted at index 0.
    pub summary: Message,
    /// Tail preserved verbatim, starting at the last safe fork point.
    pub retained: Vec<Message>,
    /// tokens-after / tokens-before.
    pub ratio: f32,
}

/// Token-pressure analysis and history compression.
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    fn total_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Message::approx_tokens).sum()
    }

    /// Whether the history is under enough pressure to compress.
    pub fn should_compress(&self, messages: &[Message]) -> bool {
        if !self.config.enable_compression || self.config.max_tokens == 0 {
            return false;
        }
        let threshold = (self.config.max_tokens as f32 * self.config.compress_at) as usize;
        Self::total_tokens(messages) >= threshold
    }

    /// Index of the last safe fork point: the last user message, or the last
    /// assistant message containing no tool use.
    pub fn find_sfp(messages: &[Message]) -> Option<usize> {
        messages.iter().rposition(|m| match m.role {
            Role::User => true,
            Role::Assistant => !m
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. })),
            Role::System => false,
        })
    }

    /// Compress everything before the last safe fork point into one
    /// summary message produced by an auxiliary tool-free model call.
    ///
    /// Returns `None` when there is nothing worth compressing or the summary
    /// call fails — compression is always allowed to no-op.
    pub async fn compress(
        &self,
        messages: &[Message],
        provider: &Arc<dyn ModelProvider>,
        model: &str,
    ) -> Option<CompressionResult> {
        let sfp = Self::find_sfp(messages)?;
        if sfp == 0 {
            return None;
        }
        let to_summarize = &messages[..sfp];
        let retained: Vec<Message> = messages[sfp..].to_vec();
        let tokens_before = Self::total_tokens(messages);

        let history_text = serialize_history(to_summarize);
        let req = ModelRequest {
            model: model.to_string(),
            messages: vec![Message::user(format!(
                "{SUMMARIZE_PROMPT}\n\n---\n\n{history_text}"
            ))],
            ..Default::default()
        };

        let mut stream = match provider.stream(req).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "compression summary call failed; keeping history");
                return None;
            }
        };
        let mut summary_text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(StreamChunk::TextDelta(t)) => summary_text.push_str(&t),
                Ok(StreamChunk::MessageStop { .. }) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "compression summary stream failed; keeping history");
                    return None;
                }
            }
        }
        if summary_text.is_empty() {
            warn!("compression summary was empty; keeping history");
            return None;
        }

        let summary = Message::user(format!(
            "[Conversation summary — earlier history was compressed]\n{summary_text}"
        ));
        let tokens_after =
            summary.approx_tokens() + retained.iter().map(Message::approx_tokens).sum::<usize>();
        let ratio = if tokens_before == 0 {
            1.0
        } else {
            tokens_after as f32 / tokens_before as f32
        };

        Some(CompressionResult {
            summary,
            retained,
            ratio,
        })
    }
}

fn serialize_history(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        for block in &m.content {
            match block {
                ContentBlock::Text { text } => {
                    out.push_str(&format!("[{role}] {text}\n"));
                }
                ContentBlock::Thinking { .. } => {}
                ContentBlock::ToolUse { name, input, .. } => {
                    out.push_str(&format!("[{role}] called {name}({input})\n"));
                }
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => {
                    let tag = if *is_error { "tool error" } else { "tool result" };
                    out.push_str(&format!("[{tag}] {content}\n"));
                }
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::ScriptedProvider;
    use serde_json::json;

    fn manager(max_tokens: usize) -> ContextManager {
        ContextManager::new(ContextConfig {
            max_tokens,
            compress_at: 0.8,
            enable_compression: true,
        })
    }

    // ── Pressure analysis ─────────────────────────────────────────────────────

    #[test]
    fn small_history_is_not_compressed() {
        let m = manager(1000);
        assert!(!m.should_compress(&[Message::user("hi")]));
    }

    #[test]
    fn pressure_trips_at_threshold() {
        let m = manager(10);
        // 10 tokens × 0.8 = 8 tokens → 32 chars crosses it.
        let messages = vec![Message::user("x".repeat(40))];
        assert!(m.should_compress(&messages));
    }

    #[test]
    fn disabled_compression_never_trips() {
        let m = ContextManager::new(ContextConfig {
            max_tokens: 10,
            compress_at: 0.1,
            enable_compression: false,
        });
        assert!(!m.should_compress(&[Message::user("x".repeat(400))]));
    }

    // ── Safe fork point ───────────────────────────────────────────────────────

    #[test]
    fn sfp_is_last_user_message() {
        let messages = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ];
        assert_eq!(ContextManager::find_sfp(&messages), Some(2));
    }

    #[test]
    fn assistant_with_tool_use_is_not_a_fork_point() {
        let messages = vec![
            Message::user("a"),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "c1".into(),
                name: "t".into(),
                input: json!({}),
            }]),
        ];
        assert_eq!(ContextManager::find_sfp(&messages), Some(0));
    }

    #[test]
    fn plain_assistant_is_a_fork_point() {
        let messages = vec![Message::user("a"), Message::assistant("done")];
        assert_eq!(ContextManager::find_sfp(&messages), Some(1));
    }

    // ── Compression ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn compress_preserves_tail_and_reports_ratio() {
        let provider: Arc<dyn ModelProvider> =
            Arc::new(ScriptedProvider::always_text("the gist of it"));
        let m = manager(10);
        let messages = vec![
            Message::user("old question ".repeat(50)),
            Message::assistant("old answer ".repeat(50)),
            Message::user("current question"),
        ];
        let result = m.compress(&messages, &provider, "mock").await.unwrap();
        assert_eq!(result.retained.len(), 1);
        assert_eq!(result.retained[0].text(), "current question");
        assert_eq!(result.summary.role, Role::User);
        assert!(result.summary.text().contains("the gist of it"));
        assert!(result.ratio < 1.0);
    }

    #[tokio::test]
    async fn compress_noops_when_nothing_precedes_the_fork_point() {
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedProvider::always_text("s"));
        let m = manager(10);
        assert!(m
            .compress(&[Message::user("only")], &provider, "mock")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn empty_summary_keeps_history() {
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedProvider::new(vec![vec![
            runa_model::StreamChunk::MessageStop {
                stop_reason: runa_model::StopReason::EndTurn,
                usage: runa_model::Usage::default(),
            },
        ]]));
        let m = manager(10);
        let messages = vec![Message::user("a"), Message::assistant("b"), Message::user("c")];
        assert!(m.compress(&messages, &provider, "mock").await.is_none());
    }
}
