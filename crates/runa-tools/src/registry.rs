// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::tool::Tool;

type Factory = Box<dyn Fn(Option<&Value>) -> Arc<dyn Tool> + Send + Sync>;

/// Central registry holding all tools available to agents.
///
/// Tools may be registered as ready instances or as factories that build a
/// configured instance per agent.  An agent's `tools: ["*"]` config expands
/// to every registered id.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    factories: HashMap<String, Factory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Register a factory that builds a configured instance on `create`.
    pub fn register_factory<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(Option<&Value>) -> Arc<dyn Tool> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Box::new(factory));
    }

    pub fn has(&self, id: &str) -> bool {
        self.tools.contains_key(id) || self.factories.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    /// Build (or fetch) a tool instance for the given id.
    pub fn create(&self, id: &str, config: Option<&Value>) -> Option<Arc<dyn Tool>> {
        if let Some(factory) = self.factories.get(id) {
            return Some(factory(config));
        }
        self.get(id)
    }

    /// All registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tools
            .keys()
            .chain(self.factories.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Expand an agent's configured tool id list; `"*"` means every
    /// registered tool.
    pub fn resolve(&self, patterns: &[String]) -> Vec<String> {
        if patterns.iter().any(|p| p == "*") {
            return self.list();
        }
        let mut ids: Vec<String> = patterns
            .iter()
            .filter(|p| self.has(p))
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
