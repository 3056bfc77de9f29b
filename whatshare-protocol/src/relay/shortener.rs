//! HTTP relay over a URL-shortening service
//!
//! Speaks the classic shortener JSON API:
//!
//! ```text
//! POST {api_url}                         {"longUrl": "<landing>?d=..."}  ->  {"id": "<short url>"}
//! GET  {api_url}?shortUrl=<short url>                                    ->  {"longUrl": "...", "status": "OK"}
//! ```
//!
//! The pairing code is the short URL with the configured prefix removed.
//! Long URLs carry key material, so they are never logged.

use super::retry::{retry, RetryPolicy};
use super::{PairingCode, RelayClient};
use crate::descriptor::PairingDescriptor;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Expected value of the `status` field of an expand response
const STATUS_OK: &str = "OK";

/// Endpoints and credentials for a shortener service
#[derive(Debug, Clone)]
pub struct ShortenerConfig {
    /// Shorten/expand endpoint
    pub api_url: Url,
    /// Prefix of every short URL the service mints (e.g. `https://goo.gl/`)
    pub short_url_prefix: String,
    /// URL the descriptor is embedded into
    pub landing_url: Url,
    /// Optional API key, sent as the `key` query parameter
    pub api_key: Option<String>,
    /// Timeout for a single HTTP request
    pub request_timeout: Duration,
}

impl ShortenerConfig {
    /// Build a configuration from textual URLs
    pub fn new(api_url: &str, short_url_prefix: &str, landing_url: &str) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .map_err(|e| ProtocolError::Configuration(format!("Invalid relay API URL: {}", e)))?;
        let landing_url = Url::parse(landing_url)
            .map_err(|e| ProtocolError::Configuration(format!("Invalid landing URL: {}", e)))?;

        Ok(Self {
            api_url,
            short_url_prefix: short_url_prefix.to_string(),
            landing_url,
            api_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Set the API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShortenRequest<'a> {
    long_url: &'a str,
}

#[derive(Deserialize)]
struct ShortenResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpandResponse {
    long_url: Option<String>,
    status: Option<String>,
}

/// [`RelayClient`] backed by an HTTP URL shortener
pub struct UrlShortenerRelay {
    client: reqwest::Client,
    config: ShortenerConfig,
    policy: RetryPolicy,
}

impl UrlShortenerRelay {
    /// Create a relay client
    pub fn new(config: ShortenerConfig, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("whatshare/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProtocolError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            policy,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ShortenerConfig {
        &self.config
    }

    /// Full short URL for `code`
    pub fn short_url(&self, code: &PairingCode) -> String {
        format!("{}{}", self.config.short_url_prefix, code)
    }

    /// Extract the pairing code from a short URL minted by the service
    pub fn code_from_short_url(&self, short_url: &str) -> Result<PairingCode> {
        let code = match short_url.strip_prefix(&self.config.short_url_prefix) {
            Some(rest) if !self.config.short_url_prefix.is_empty() => rest.to_string(),
            _ => Url::parse(short_url)
                .ok()
                .and_then(|url| {
                    url.path_segments()
                        .and_then(|mut segments| segments.next_back().map(str::to_string))
                })
                .unwrap_or_default(),
        };

        let code = PairingCode::new(code.trim_matches('/'));
        if code.as_str().is_empty() {
            return Err(ProtocolError::Relay(format!(
                "Malformed short URL: {}",
                short_url
            )));
        }
        Ok(code)
    }

    fn endpoint(&self) -> Url {
        let mut url = self.config.api_url.clone();
        if let Some(key) = &self.config.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        url
    }

    async fn shorten_once(&self, long_url: &Url) -> Result<PairingCode> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&ShortenRequest {
                long_url: long_url.as_str(),
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: ShortenResponse = response
            .json()
            .await
            .map_err(|e| ProtocolError::Relay(format!("Malformed shortener response: {}", e)))?;

        self.code_from_short_url(&body.id)
    }

    async fn expand_once(&self, code: &PairingCode) -> Result<PairingDescriptor> {
        let mut url = self.endpoint();
        url.query_pairs_mut()
            .append_pair("shortUrl", &self.short_url(code));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProtocolError::CodeNotFound(code.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: ExpandResponse = response
            .json()
            .await
            .map_err(|e| ProtocolError::Relay(format!("Malformed shortener response: {}", e)))?;

        if let Some(status) = body.status.as_deref() {
            if status != STATUS_OK {
                debug!("Relay reports status {} for code {}", status, code);
                return Err(ProtocolError::CodeNotFound(code.to_string()));
            }
        }

        let long_url = body
            .long_url
            .ok_or_else(|| ProtocolError::CodeNotFound(code.to_string()))?;

        PairingDescriptor::from_long_url(&long_url).map_err(|e| {
            warn!("Code {} does not resolve to a pairing descriptor: {}", code, e);
            ProtocolError::CodeNotFound(code.to_string())
        })
    }
}

#[async_trait]
impl RelayClient for UrlShortenerRelay {
    async fn publish(&self, descriptor: &PairingDescriptor) -> Result<PairingCode> {
        let long_url = descriptor.to_long_url(&self.config.landing_url)?;
        debug!(
            "Publishing pairing descriptor for {} ({})",
            descriptor.device_type,
            descriptor.secret.fingerprint()
        );

        let code = retry(&self.policy, "Publish pairing descriptor", || {
            self.shorten_once(&long_url)
        })
        .await?;

        info!("Relay issued pairing code {}", code);
        Ok(code)
    }

    async fn resolve(&self, code: &PairingCode) -> Result<PairingDescriptor> {
        debug!("Resolving pairing code {}", code);

        let descriptor = retry(&self.policy, "Resolve pairing code", || {
            self.expand_once(code)
        })
        .await?;

        info!(
            "Pairing code {} resolved to a {} descriptor",
            code, descriptor.device_type
        );
        Ok(descriptor)
    }
}

/// Classify a transport-level failure
fn transport_error(e: reqwest::Error) -> ProtocolError {
    if e.is_timeout() {
        ProtocolError::RelayUnavailable(format!("Request timed out: {}", e))
    } else if e.is_connect() {
        ProtocolError::RelayUnavailable(format!("Connection failed: {}", e))
    } else if e.is_builder() {
        ProtocolError::Relay(format!("Invalid request: {}", e))
    } else {
        ProtocolError::RelayUnavailable(e.to_string())
    }
}

/// Classify a non-success HTTP status
fn status_error(status: StatusCode, body: &str) -> ProtocolError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProtocolError::RelayUnavailable(format!("HTTP {}", status))
    } else {
        ProtocolError::Relay(format!("HTTP {}: {}", status, body.trim()))
    }
}
