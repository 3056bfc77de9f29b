//! Forwarded payload sealing
//!
//! Content shared on this device is sealed with the outbound device's
//! secret; content received from an inbound device is opened with that
//! device's secret. Failures are per message and never change a pairing.

use crate::registry::DeviceRegistry;
use crate::{ProtocolError, Result};
use tracing::{debug, warn};

/// Encrypt `payload` for the outbound device
///
/// # Errors
///
/// Returns `ProtocolError::NotPaired` if no outbound device is paired.
pub fn seal_for_outbound(registry: &DeviceRegistry, payload: &[u8]) -> Result<Vec<u8>> {
    let device = registry.outbound().ok_or(ProtocolError::NotPaired)?;

    let sealed = device.secret.encrypt(payload)?;
    debug!(
        "Sealed {} byte payload for outbound device '{}'",
        payload.len(),
        device.name
    );
    Ok(sealed)
}

/// Decrypt `ciphertext` received from the inbound device called `name`
///
/// # Errors
///
/// - `NotFound` if no inbound device has this name
/// - `Authentication` if the payload was not sealed with that device's secret
pub fn open_from_inbound(registry: &DeviceRegistry, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let device = registry
        .inbound(name)
        .ok_or_else(|| ProtocolError::NotFound(format!("inbound device '{}'", name)))?;

    device.secret.decrypt(ciphertext).map_err(|e| {
        warn!("Dropping payload from '{}': {}", name, e);
        e
    })
}
