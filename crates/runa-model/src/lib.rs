// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod provider;
mod types;

pub use mock::{MockProvider, ScriptedProvider};
pub use provider::{ChunkStream, ModelProvider};
pub use types::{
    ContentBlock, Message, ModelRequest, Role, StopReason, StreamChunk, ToolSchema, Usage,
};
