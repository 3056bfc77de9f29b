//! In-process relay
//!
//! Stores descriptors in a map keyed by minted codes. Used by tests and for
//! pairing two devices driven by the same process.

use super::retry::{retry, RetryPolicy};
use super::{PairingCode, RelayClient};
use crate::descriptor::PairingDescriptor;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Failure to return from the next relay call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Service unavailable (retried by callers)
    Transient,
    /// Request rejected
    Permanent,
}

impl InjectedFailure {
    fn into_error(self) -> ProtocolError {
        match self {
            InjectedFailure::Transient => {
                ProtocolError::RelayUnavailable("injected transient failure".to_string())
            }
            InjectedFailure::Permanent => {
                ProtocolError::Relay("injected permanent failure".to_string())
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    /// code -> descriptor JSON
    entries: HashMap<String, String>,
    scripted_codes: VecDeque<String>,
    failures: VecDeque<InjectedFailure>,
    next_id: u64,
    publish_calls: usize,
    resolve_calls: usize,
}

/// [`RelayClient`] keeping everything in memory
///
/// Injected transient failures are retried according to the relay's
/// [`RetryPolicy`], which defaults to a single attempt.
pub struct MemoryRelay {
    state: Mutex<MemoryState>,
    policy: RetryPolicy,
    delay: Option<Duration>,
    single_use: bool,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            policy: RetryPolicy::no_retry(),
            delay: None,
            single_use: false,
        }
    }
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint these codes, in order, before falling back to generated ones
    pub fn with_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let relay = Self::new();
        if let Ok(mut state) = relay.state.lock() {
            state.scripted_codes = codes.into_iter().map(Into::into).collect();
        }
        relay
    }

    /// Retry transient failures with `policy`
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Delay every response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Forget a code once it has been resolved
    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    /// Fail the next call (publish or resolve) with `failure`
    pub fn fail_next(&self, failure: InjectedFailure) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push_back(failure);
        }
    }

    /// Number of publish calls received
    pub fn publish_calls(&self) -> usize {
        self.state.lock().map(|s| s.publish_calls).unwrap_or(0)
    }

    /// Number of resolve calls received
    pub fn resolve_calls(&self) -> usize {
        self.state.lock().map(|s| s.resolve_calls).unwrap_or(0)
    }

    /// Number of codes currently resolvable
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Check if no code is resolvable
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| ProtocolError::Relay(format!("Failed to acquire relay lock: {}", e)))
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn publish_once(&self, descriptor: &PairingDescriptor) -> Result<PairingCode> {
        self.pause().await;
        let json = descriptor.to_json()?;

        let mut state = self.lock()?;
        state.publish_calls += 1;
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure.into_error());
        }

        let code = match state.scripted_codes.pop_front() {
            Some(code) => code,
            None => loop {
                state.next_id += 1;
                let candidate = to_base36(state.next_id + 36 * 36 * 36);
                if !state.entries.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        state.entries.insert(code.clone(), json);
        debug!("Memory relay stored descriptor under {}", code);
        Ok(PairingCode::new(code))
    }

    async fn resolve_once(&self, code: &PairingCode) -> Result<PairingDescriptor> {
        self.pause().await;

        let json = {
            let mut state = self.lock()?;
            state.resolve_calls += 1;
            if let Some(failure) = state.failures.pop_front() {
                return Err(failure.into_error());
            }

            let found = if self.single_use {
                state.entries.remove(code.as_str())
            } else {
                state.entries.get(code.as_str()).cloned()
            };
            found.ok_or_else(|| ProtocolError::CodeNotFound(code.to_string()))?
        };

        PairingDescriptor::from_json(&json)
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn publish(&self, descriptor: &PairingDescriptor) -> Result<PairingCode> {
        retry(&self.policy, "Publish pairing descriptor", || {
            self.publish_once(descriptor)
        })
        .await
    }

    async fn resolve(&self, code: &PairingCode) -> Result<PairingDescriptor> {
        retry(&self.policy, "Resolve pairing code", || self.resolve_once(code)).await
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SharedSecret;

    fn descriptor() -> PairingDescriptor {
        PairingDescriptor::new("Pixel", SharedSecret::from_words(vec![7, 42, 19]))
    }

    #[tokio::test]
    async fn test_publish_then_resolve() {
        let relay = MemoryRelay::new();

        let code = relay.publish(&descriptor()).await.unwrap();
        assert_eq!(code.as_str().len(), 4);

        assert_eq!(relay.resolve(&code).await.unwrap(), descriptor());
        assert_eq!(relay.resolve(&code).await.unwrap(), descriptor());
        assert_eq!(relay.publish_calls(), 1);
        assert_eq!(relay.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn test_scripted_codes() {
        let relay = MemoryRelay::with_codes(["ab12"]);

        let first = relay.publish(&descriptor()).await.unwrap();
        let second = relay.publish(&descriptor()).await.unwrap();

        assert_eq!(first.as_str(), "ab12");
        assert_ne!(second, first);
        assert_eq!(relay.len(), 2);
    }

    #[tokio::test]
    async fn test_single_use_codes() {
        let relay = MemoryRelay::new().single_use();
        let code = relay.publish(&descriptor()).await.unwrap();

        relay.resolve(&code).await.unwrap();
        let err = relay.resolve(&code).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CodeNotFound(_)));
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let relay = MemoryRelay::new();
        relay.fail_next(InjectedFailure::Transient);
        relay.fail_next(InjectedFailure::Permanent);

        let err = relay.publish(&descriptor()).await.unwrap_err();
        assert!(err.is_transient());

        let err = relay.publish(&descriptor()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Relay(_)));

        assert!(relay.publish(&descriptor()).await.is_ok());
        assert_eq!(relay.publish_calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_applies() {
        let relay = MemoryRelay::new().with_retry(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(1),
        ));
        relay.fail_next(InjectedFailure::Transient);
        relay.fail_next(InjectedFailure::Transient);

        let code = relay.publish(&descriptor()).await.unwrap();
        assert_eq!(relay.publish_calls(), 3);

        relay.fail_next(InjectedFailure::Permanent);
        assert!(relay.resolve(&code).await.is_err());
        assert_eq!(relay.resolve_calls(), 1);
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36 * 36 * 36), "1000");
    }
}
