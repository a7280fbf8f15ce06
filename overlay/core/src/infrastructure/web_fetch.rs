// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Link Fetcher
//!
//! Backs `.url` web-link views and `/.magic/api` feeds.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Fetch remote bytes for a read-time view
//! - **Integration:** ViewResolver → reqwest → remote server
//!
//! The client carries its own request timeout; the resolver additionally
//! wraps every call in `tokio::time::timeout`, so a hung server can never
//! hold a filesystem read past the configured bound.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::domain::views::{FetchError, LinkFetcher};

/// Responses larger than this are refused.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct HttpLinkFetcher {
    client: Client,
}

impl HttpLinkFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("eidetic/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    fn check_url(url: &str) -> Result<(), FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(FetchError::InvalidUrl(format!("unsupported scheme: {}", other))),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl LinkFetcher for HttpLinkFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Self::check_url(url)?;
        debug!(url = %url, "Fetching web link");

        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::OK => {
                if response
                    .content_length()
                    .is_some_and(|len| len as usize > MAX_BODY_BYTES)
                {
                    return Err(FetchError::Network("response too large".to_string()));
                }
                let body = response.bytes().await?;
                if body.len() > MAX_BODY_BYTES {
                    return Err(FetchError::Network("response too large".to_string()));
                }
                Ok(body.to_vec())
            }
            status => Err(FetchError::Status(status.as_u16())),
        }
    }
}
