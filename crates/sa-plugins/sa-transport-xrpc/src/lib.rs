//! # sa-transport-xrpc
//!
//! `SignedTransport` over plain HTTPS: `GET {service}/xrpc/{method}` with a
//! bearer token. Session creation and refresh happen elsewhere; this crate
//! only attaches the token it was given.

use std::time::Duration;

use async_trait::async_trait;
use sa_core::error::{AppError, Result};
use sa_core::traits::{SignedTransport, XrpcQuery};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body echoed back in `AppError::Remote`.
const MAX_ERROR_BODY: usize = 512;

pub struct XrpcTransport {
    client: reqwest::Client,
    service_url: String,
    access_token: Option<SecretString>,
}

impl XrpcTransport {
    pub fn new(service_url: &str, access_token: Option<SecretString>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(client, service_url, access_token))
    }

    pub fn with_client(client: reqwest::Client, service_url: &str, access_token: Option<SecretString>) -> Self {
        Self {
            client,
            service_url: service_url.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    pub fn endpoint(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service_url, method)
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl SignedTransport for XrpcTransport {
    async fn query(&self, subject: &str, query: &XrpcQuery) -> Result<Value> {
        let mut request = self.client.get(self.endpoint(&query.method)).query(&query.params);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token.expose_secret());
        }

        tracing::debug!(method = %query.method, subject, "xrpc query");
        let response = request
            .send()
            .await
            .map_err(|e| AppError::Remote(format!("{}: {e}", query.method)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Remote(format!("{} returned {status}: {}", query.method, truncate(body))));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::Remote(format!("{}: invalid json body: {e}", query.method)))
    }
}
