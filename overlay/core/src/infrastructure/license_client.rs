// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! License service client.
//!
//! POSTs `{"key": "<license key>"}` to the configured endpoint and expects
//! `{"valid": true|false}` back. Anything else counts as an error, which the
//! license check turns into free mode.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::application::license::{LicenseError, LicenseVerifier};

#[derive(Serialize)]
struct VerifyRequest<'a> {
    key: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
}

pub struct HttpLicenseVerifier {
    client: Client,
    endpoint: String,
}

impl HttpLicenseVerifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, LicenseError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LicenseError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl LicenseVerifier for HttpLicenseVerifier {
    async fn verify(&self, key: &str) -> Result<bool, LicenseError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&VerifyRequest { key })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LicenseError::Timeout
                } else {
                    LicenseError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(LicenseError::Rejected(format!(
                "license service returned {}",
                response.status()
            )));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| LicenseError::Malformed(e.to_string()))?;
        Ok(body.valid)
    }
}
