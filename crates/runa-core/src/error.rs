// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use runa_events::RuntimeState;
use runa_store::StorageError;

/// Typed error surface of the core runtime.
///
/// Tool errors never appear here — they are recorded on the tool-call
/// record and surfaced to the model as error tool results.  Provider errors
/// bubble out of a step and are caught at the run level, leaving the agent
/// in `Ready` so retries are possible.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("provider '{provider}' error: {message}")]
    Provider {
        provider: String,
        status_code: Option<u16>,
        message: String,
    },
    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },
    #[error("tool '{tool}' execution failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("invalid agent state: current {current:?}, expected {expected:?}")]
    InvalidState {
        current: RuntimeState,
        expected: RuntimeState,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<runa_config::ConfigError> for CoreError {
    fn from(e: runa_config::ConfigError) -> Self {
        CoreError::Configuration(e.to_string())
    }
}
