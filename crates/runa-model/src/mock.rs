// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ChunkStream, ModelProvider, ModelRequest, Role, StopReason, StreamChunk, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, req: ModelRequest) -> anyhow::Result<ChunkStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let chunks: Vec<anyhow::Result<StreamChunk>> = vec![
            Ok(StreamChunk::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamChunk::MessageStop {
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
            }),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// A pre-scripted mock provider.  Each call to `stream` pops the next chunk
/// script from the front of the queue.  This lets tests specify exact chunk
/// sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamChunk>>>>,
    /// The last `ModelRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ModelRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of chunk scripts.  The outer `Vec` is the
    /// ordered list of calls; the inner `Vec` is the chunk sequence emitted
    /// for that call.
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// One script that streams `reply` then stops with `EndTurn`.
    pub fn text_script(reply: impl Into<String>) -> Vec<StreamChunk> {
        vec![
            StreamChunk::TextDelta(reply.into()),
            StreamChunk::MessageStop {
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
            },
        ]
    }

    /// One script that emits a single complete tool call then stops with
    /// `ToolUse`.
    pub fn tool_call_script(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<StreamChunk> {
        let id = id.into();
        vec![
            StreamChunk::ToolUseStart {
                id: id.clone(),
                name: name.into(),
            },
            StreamChunk::ToolUseInputDelta {
                id: id.clone(),
                delta: args_json.into(),
            },
            StreamChunk::ToolUseComplete { id },
            StreamChunk::MessageStop {
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
            },
        ]
    }

    /// Convenience: a tool call on the first round, a text reply on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(tool_id, tool_name, args_json),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream(&self, req: ModelRequest) -> anyhow::Result<ChunkStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let chunks = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamChunk>> = chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Message;

    fn req() -> ModelRequest {
        ModelRequest {
            model: "mock-model".into(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.stream(req()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            StreamChunk::TextDelta(t) => assert!(t.contains("MOCK: hi")),
            other => panic!("unexpected first chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_message_stop() {
        let p = MockProvider;
        let mut stream = p.stream(req()).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(c) = stream.next().await {
            chunks.push(c.unwrap());
        }
        assert!(matches!(
            chunks.last(),
            Some(StreamChunk::MessageStop { .. })
        ));
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let p = ScriptedProvider::tool_then_text("c1", "shell", r#"{"command":"ls"}"#, "done");

        let mut chunks = Vec::new();
        let mut s = p.stream(req()).await.unwrap();
        while let Some(c) = s.next().await {
            chunks.push(c.unwrap());
        }
        assert!(chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::ToolUseStart { name, .. } if name == "shell")));

        let mut chunks2 = Vec::new();
        let mut s2 = p.stream(req()).await.unwrap();
        while let Some(c) = s2.next().await {
            chunks2.push(c.unwrap());
        }
        assert!(chunks2
            .iter()
            .any(|c| matches!(c, StreamChunk::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedProvider::new(vec![]);
        let mut s = p.stream(req()).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::TextDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn scripted_captures_last_request() {
        let p = ScriptedProvider::always_text("ok");
        let _ = p.stream(req()).await.unwrap();
        let captured = p.last_request.lock().unwrap();
        assert_eq!(captured.as_ref().unwrap().model, "mock-model");
    }
}
