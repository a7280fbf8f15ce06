// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Collaborators of read-time views: remote fetches and format conversion.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote returned status {0}")]
    Status(u16),
}

/// Fetches the body behind a web link.
#[async_trait]
pub trait LinkFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Synchronous, CPU-bound format converter. Callers run it off the async
/// executor.
pub trait FormatConverter: Send + Sync {
    fn convert(&self, bytes: &[u8], from_ext: &str, to_ext: &str) -> Result<Vec<u8>, ConversionError>;
}
