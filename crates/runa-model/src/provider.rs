// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{ModelRequest, StreamChunk};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Boundary to a concrete model backend.
///
/// Implementations live outside the core (HTTP adapters, local runtimes);
/// the core only consumes the chunk stream.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for error reporting.
    fn name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream(&self, req: ModelRequest) -> anyhow::Result<ChunkStream>;
}
