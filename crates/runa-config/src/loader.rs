// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use tracing::debug;

use crate::schema::{AgentConfig, ConfigError};

/// Parse an agent configuration from a YAML string.
pub fn load_str(text: &str) -> Result<AgentConfig, ConfigError> {
    let cfg: AgentConfig =
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load and validate an agent configuration from a YAML file.
pub fn load_file(path: &Path) -> Result<AgentConfig, ConfigError> {
    debug!(path = %path.display(), "loading agent config");
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Parse(format!("reading {}: {e}", path.display())))?;
    load_str(&text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
