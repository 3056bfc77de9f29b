//! Pairing Code Relay
//!
//! A URL-shortening service is used as a one-shot, blind relay: the
//! publishing device stores its [`PairingDescriptor`] in a long URL and gets
//! back a short code the user can read aloud or type; the other device
//! expands the code back into the descriptor.
//!
//! The relay is untrusted. Nothing it returns is committed anywhere by this
//! module, and both operations are safe to retry.
//!
//! ## Failure Classes
//!
//! | Failure                      | Error              | Retried |
//! |------------------------------|--------------------|---------|
//! | timeout, connect, 5xx, 429   | `RelayUnavailable` | yes     |
//! | other 4xx, malformed body    | `Relay`            | no      |
//! | unknown/expired/removed code | `CodeNotFound`     | no      |

pub mod memory;
pub mod retry;
pub mod shortener;

use crate::descriptor::PairingDescriptor;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::{InjectedFailure, MemoryRelay};
pub use retry::{retry, Backoff, RetryPolicy};
pub use shortener::{ShortenerConfig, UrlShortenerRelay};

/// Short opaque code minted by the relay service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    /// Wrap a code minted by a relay
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    /// Parse a code typed by the user
    ///
    /// Surrounding whitespace is removed. An empty code can never resolve and
    /// is rejected without contacting the relay.
    pub fn parse(input: &str) -> Result<Self> {
        let code = Self::new(input);
        if code.0.is_empty() {
            return Err(ProtocolError::CodeNotFound("empty code".to_string()));
        }
        Ok(code)
    }

    /// The code as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client for a pairing relay
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Publish a descriptor and obtain the code that resolves to it
    async fn publish(&self, descriptor: &PairingDescriptor) -> Result<PairingCode>;

    /// Expand a code back into the descriptor it was published for
    async fn resolve(&self, code: &PairingCode) -> Result<PairingDescriptor>;
}
