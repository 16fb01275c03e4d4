use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single content block inside a message.
///
/// Blocks are the unit the model streams and the unit context repair
/// rewrites: an orphaned `ToolResult` is demoted to a `Text` block in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// A single message in the conversation history.
///
/// Messages are append-only during a run; compression replaces a prefix with
/// one synthesized user summary message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: blocks,
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: blocks,
        }
    }

    /// Return the concatenated text of this message's `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All `ToolUse` blocks in this message, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// Approximate token count used for context-pressure decisions.
    /// Uses the 4-chars-per-token heuristic.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } | ContentBlock::Thinking { text } => text.len(),
                ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => content.len(),
            })
            .sum();
        (chars / 4).max(1)
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub enable_thinking: bool,
    pub thinking_budget: Option<u32>,
}

// ─── Streaming ────────────────────────────────────────────────────────────────

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token usage reported at stream completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A single streamed event from the model.
///
/// `ToolUseStart` opens a tool-use block; `ToolUseInputDelta` accumulates
/// JSON argument text per id; `ToolUseComplete` closes it.  `MessageStop`
/// always terminates the stream.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ThinkingDelta(String),
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta { id: String, delta: String },
    ToolUseComplete { id: String },
    MessageStop { stop_reason: StopReason, usage: Usage },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn message_text_concatenates_text_blocks_only() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("a"),
            ContentBlock::Thinking { text: "x".into() },
            ContentBlock::text("b"),
        ]);
        assert_eq!(m.text(), "ab");
    }

    #[test]
    fn tool_uses_returns_blocks_in_order() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::ToolUse {
                id: "c1".into(),
                name: "fs_read".into(),
                input: serde_json::json!({"path": "a.txt"}),
            },
            ContentBlock::text("and"),
            ContentBlock::ToolUse {
                id: "c2".into(),
                name: "bash".into(),
                input: serde_json::json!({}),
            },
        ]);
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "c1");
        assert_eq!(uses[1].1, "bash");
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("hi").approx_tokens(), 1);
    }

    // ── Serde round-trips ─────────────────────────────────────────────────────

    #[test]
    fn content_block_tags_are_snake_case() {
        let b = ContentBlock::ToolUse {
            id: "c1".into(),
            name: "t".into(),
            input: serde_json::json!({}),
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"type\":\"tool_use\""), "{json}");
    }

    #[test]
    fn tool_result_round_trips_error_flag() {
        let b = ContentBlock::tool_result("c1", "boom", true);
        let json = serde_json::to_string(&b).unwrap();
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn tool_result_is_error_defaults_false_on_read() {
        let json = r#"{"type":"tool_result","tool_use_id":"c1","content":"ok"}"#;
        let b: ContentBlock = serde_json::from_str(json).unwrap();
        assert!(matches!(b, ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn usage_total_is_sum() {
        let u = Usage {
            input_tokens: 2,
            output_tokens: 1,
        };
        assert_eq!(u.total_tokens(), 3);
    }
}
