// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for opt-out fields.
fn default_true() -> bool {
    true
}

/// Error raised when a configuration is structurally invalid at
/// agent creation or resume time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Effective per-agent configuration.
///
/// The full config is serialized into the persisted agent meta so that an
/// agent is resumable from its stored `AgentInfo` alone.  Unknown keys under
/// `metadata` are carried through untouched — forward compatibility depends
/// on tolerant reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model identifier forwarded to the provider.  Required: `validate()`
    /// rejects an empty value.
    #[serde(default)]
    pub model: String,
    /// System prompt; `None` means the hosting application supplies one.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool ids enabled for this agent.  `"*"` expands to every tool in the
    /// registry.
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub subagents: SubagentsConfig,
    /// Surface thinking deltas on the progress channel.
    #[serde(default)]
    pub expose_thinking: bool,
    /// Enable extended thinking on providers that support it.
    #[serde(default)]
    pub enable_thinking: bool,
    /// Token budget for extended thinking.
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    /// Maximum tokens to request in a single completion.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Free-form application metadata, persisted verbatim.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_tools() -> Vec<String> {
    vec!["*".into()]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            tools: default_tools(),
            permissions: PermissionsConfig::default(),
            limits: LimitsConfig::default(),
            context: ContextConfig::default(),
            skills: SkillsConfig::default(),
            subagents: SubagentsConfig::default(),
            expose_thinking: false,
            enable_thinking: false,
            thinking_budget: None,
            max_tokens: None,
            temperature: None,
            metadata: serde_json::Map::new(),
        }
    }
}

impl AgentConfig {
    /// Structural validation performed at `create` / `resume`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must be set".into()));
        }
        if self.limits.max_tool_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_tool_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ─── Permissions ──────────────────────────────────────────────────────────────

/// Gating mode applied to every tool call.
///
/// `Custom` carries the name of a handler registered with the permission
/// manager at runtime; an unregistered name falls back to asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionMode {
    Auto,
    Approval,
    ReadOnly,
    Custom(String),
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Auto
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Auto => write!(f, "auto"),
            PermissionMode::Approval => write!(f, "approval"),
            PermissionMode::ReadOnly => write!(f, "readonly"),
            PermissionMode::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl Serialize for PermissionMode {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PermissionMode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(match raw.as_str() {
            "auto" => PermissionMode::Auto,
            "approval" => PermissionMode::Approval,
            "readonly" => PermissionMode::ReadOnly,
            _ => PermissionMode::Custom(raw),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub mode: PermissionMode,
    /// When set, only these tools are allowed; everything else is denied.
    #[serde(default)]
    pub allow_tools: Option<Vec<String>>,
    /// Tools denied unconditionally, regardless of mode.
    #[serde(default)]
    pub deny_tools: Vec<String>,
    /// Tools that always require an approval decision in `auto` mode.
    #[serde(default)]
    pub require_approval_tools: Vec<String>,
}

// ─── Limits ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum model-call iterations per run before the loop reports
    /// completion.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Concurrent tool executions per agent.
    #[serde(default = "default_max_tool_concurrency")]
    pub max_tool_concurrency: usize,
    /// Per-tool-call timeout in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Heartbeat staleness after which a processing task is considered hung
    /// and replaced.
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    50
}
fn default_max_tool_concurrency() -> usize {
    3
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_processing_timeout_secs() -> u64 {
    300
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tool_concurrency: default_max_tool_concurrency(),
            tool_timeout_secs: default_tool_timeout_secs(),
            processing_timeout_secs: default_processing_timeout_secs(),
        }
    }
}

// ─── Context management ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window budget in approximate tokens.
    #[serde(default = "default_max_context_tokens")]
    pub max_tokens: usize,
    /// Fraction of the budget at which compression triggers (0.0–1.0).
    #[serde(default = "default_compress_at")]
    pub compress_at: f32,
    /// Allow the context manager to issue an auxiliary model call for the
    /// summary.  When `false`, compression is a no-op.
    #[serde(default = "default_true")]
    pub enable_compression: bool,
}

fn default_max_context_tokens() -> usize {
    128_000
}
fn default_compress_at() -> f32 {
    0.8
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_context_tokens(),
            compress_at: default_compress_at(),
            enable_compression: true,
        }
    }
}

// ─── Skills ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directories scanned for skill packages (each a directory containing a
    /// `SKILL.md`).
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Skill names activated automatically at agent creation.
    #[serde(default)]
    pub auto_activate: Vec<String>,
    /// Skill names surfaced as a recommendation hint in the system prompt
    /// without being activated.
    #[serde(default)]
    pub recommend: Vec<String>,
}

// ─── Sub-agents ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentsConfig {
    /// Maximum delegation depth (lineage length).
    #[serde(default = "default_subagent_depth")]
    pub depth: usize,
    /// Permission mode override applied to every delegated child.
    #[serde(default)]
    pub permission_override: Option<PermissionMode>,
}

fn default_subagent_depth() -> usize {
    3
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            depth: default_subagent_depth(),
            permission_override: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn default_config_fails_validation_without_model() {
        let cfg = AgentConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_with_model_validates() {
        let cfg = AgentConfig {
            model: "test-model".into(),
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_tool_concurrency_is_rejected() {
        let mut cfg = AgentConfig {
            model: "m".into(),
            ..AgentConfig::default()
        };
        cfg.limits.max_tool_concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_tools_is_wildcard() {
        assert_eq!(AgentConfig::default().tools, vec!["*".to_string()]);
    }

    #[test]
    fn default_limits_match_documented_values() {
        let l = LimitsConfig::default();
        assert_eq!(l.max_tool_concurrency, 3);
        assert_eq!(l.tool_timeout_secs, 60);
        assert_eq!(l.processing_timeout_secs, 300);
    }

    // ── Permission mode serde ─────────────────────────────────────────────────

    #[test]
    fn permission_mode_round_trips_known_values() {
        for (mode, text) in [
            (PermissionMode::Auto, "\"auto\""),
            (PermissionMode::Approval, "\"approval\""),
            (PermissionMode::ReadOnly, "\"readonly\""),
        ] {
            assert_eq!(serde_json::to_string(&mode).unwrap(), text);
            let back: PermissionMode = serde_json::from_str(text).unwrap();
            assert_eq!(back, mode);
        }
    }

    #[test]
    fn unknown_permission_mode_becomes_custom() {
        let m: PermissionMode = serde_json::from_str("\"team-policy\"").unwrap();
        assert_eq!(m, PermissionMode::Custom("team-policy".into()));
    }

    // ── Metadata passthrough ──────────────────────────────────────────────────

    #[test]
    fn metadata_survives_round_trip() {
        let mut cfg = AgentConfig {
            model: "m".into(),
            ..AgentConfig::default()
        };
        cfg.metadata
            .insert("custom".into(), serde_json::json!({"nested": [1, 2, 3]}));
        let json = serde_json::to_string(&cfg).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata["custom"]["nested"][2], 3);
    }
}
