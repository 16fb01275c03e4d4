// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use runa_config::{PermissionMode, PermissionsConfig};

use crate::tool::{ToolAccess, ToolMeta};

/// Outcome of a mode-based gating decision for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
    Ask { reason: String },
}

/// Handler for a custom permission mode, registered by name.
pub type CustomHandler = dyn Fn(&str, &Value, &ToolMeta) -> PolicyDecision + Send + Sync;

/// Policy engine that maps a tool call to allow / deny / ask.
///
/// Tool lists accept simple glob patterns (`*` matches anything, `?` one
/// char), so `deny_tools: ["fs_*"]` covers a whole family.  `Deny` here is
/// the hard-deny path; `Ask` escalates to the runtime approval flow.
pub struct PermissionPolicy {
    mode: PermissionMode,
    deny: Vec<Regex>,
    allow: Option<Vec<Regex>>,
    require_approval: Vec<Regex>,
    custom: HashMap<String, Box<CustomHandler>>,
}

impl PermissionPolicy {
    pub fn new(config: PermissionsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            deny: compile(&config.deny_tools),
            allow: config.allow_tools.as_deref().map(compile),
            require_approval: compile(&config.require_approval_tools),
            mode: config.mode,
            custom: HashMap::new(),
        }
    }

    pub fn mode(&self) -> &PermissionMode {
        &self.mode
    }

    /// Register the handler backing a `PermissionMode::Custom` name.
    pub fn register_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&str, &Value, &ToolMeta) -> PolicyDecision + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Box::new(handler));
    }

    /// Decide whether `name` may run with `input`.
    ///
    /// The deny list is checked first regardless of mode, then the allow
    /// list, then the mode-specific rule.
    pub fn decide(&self, name: &str, input: &Value, meta: &ToolMeta) -> PolicyDecision {
        if matches_any(&self.deny, name) {
            return PolicyDecision::Deny {
                reason: format!("tool '{name}' is denied by policy"),
            };
        }
        if let Some(allowed) = &self.allow {
            if !matches_any(allowed, name) {
                return PolicyDecision::Deny {
                    reason: format!("tool '{name}' is not in the allow list"),
                };
            }
        }

        match &self.mode {
            PermissionMode::Auto => {
                if matches_any(&self.require_approval, name) {
                    PolicyDecision::Ask {
                        reason: format!("tool '{name}' requires approval"),
                    }
                } else {
                    PolicyDecision::Allow
                }
            }
            PermissionMode::Approval => PolicyDecision::Ask {
                reason: "approval mode requires a decision for every tool call".into(),
            },
            PermissionMode::ReadOnly => self.decide_readonly(name, meta),
            PermissionMode::Custom(handler_name) => match self.custom.get(handler_name) {
                Some(handler) => handler(name, input, meta),
                None => {
                    warn!(mode = %handler_name, "no handler registered for custom permission mode");
                    PolicyDecision::Ask {
                        reason: format!("unknown permission mode '{handler_name}'"),
                    }
                }
            },
        }
    }

    fn decide_readonly(&self, name: &str, meta: &ToolMeta) -> PolicyDecision {
        if meta.mutates
            || matches!(meta.access, Some(ToolAccess::Write) | Some(ToolAccess::Execute))
        {
            return PolicyDecision::Deny {
                reason: format!("tool '{name}' mutates state and the agent is readonly"),
            };
        }
        match meta.access {
            Some(ToolAccess::Read) => PolicyDecision::Allow,
            // No declaration — ambiguous, escalate rather than guess.
            _ => PolicyDecision::Ask {
                reason: format!("tool '{name}' has no access declaration in readonly mode"),
            },
        }
    }
}

fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|re| re.is_match(name))
}

/// Convert a simple glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
