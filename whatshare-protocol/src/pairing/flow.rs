//! Pairing Flow
//!
//! Synchronous transition table for a single handshake. No I/O happens here;
//! [`PairingService`](super::PairingService) drives a flow and performs the
//! relay calls between transitions.
//!
//! ```text
//! Idle -> AwaitingScan -> DescriptorCaptured -> NamingDevice -> PublishingOrResolving -> Committed
//!            \_________________\______________________\_______________\______________-> Aborted
//! ```

use crate::descriptor::PairingDescriptor;
use crate::device::{validate_name, DeviceRole, PairedDevice};
use crate::error::ValidationError;
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a pairing handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// No handshake started
    Idle,
    /// Waiting for the QR payload (inbound) or the pairing code (outbound)
    AwaitingScan,
    /// Counterpart descriptor known
    DescriptorCaptured,
    /// Waiting for an acceptable device name
    NamingDevice,
    /// Relay call or local commit in progress
    PublishingOrResolving,
    /// Pairing stored
    Committed,
    /// Handshake abandoned
    Aborted,
}

impl PairingState {
    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Committed | PairingState::Aborted)
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairingState::Idle => "Idle",
            PairingState::AwaitingScan => "AwaitingScan",
            PairingState::DescriptorCaptured => "DescriptorCaptured",
            PairingState::NamingDevice => "NamingDevice",
            PairingState::PublishingOrResolving => "PublishingOrResolving",
            PairingState::Committed => "Committed",
            PairingState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// One pairing handshake for one role
#[derive(Debug, Clone)]
pub struct PairingFlow {
    role: DeviceRole,
    state: PairingState,
    descriptor: Option<PairingDescriptor>,
    name: Option<String>,
    abort_reason: Option<String>,
}

impl PairingFlow {
    /// Create an idle flow
    pub fn new(role: DeviceRole) -> Self {
        Self {
            role,
            state: PairingState::Idle,
            descriptor: None,
            name: None,
            abort_reason: None,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Counterpart descriptor, once captured
    pub fn descriptor(&self) -> Option<&PairingDescriptor> {
        self.descriptor.as_ref()
    }

    /// Name accepted by the last successful [`Self::propose_name`]
    pub fn accepted_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Why the flow was aborted
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `Idle -> AwaitingScan`
    pub fn start(&mut self) -> Result<()> {
        self.expect(&[PairingState::Idle], "Idle")?;
        self.state = PairingState::AwaitingScan;
        Ok(())
    }

    /// `AwaitingScan -> DescriptorCaptured`
    pub fn capture(&mut self, descriptor: PairingDescriptor) -> Result<()> {
        self.expect(&[PairingState::AwaitingScan], "AwaitingScan")?;
        self.descriptor = Some(descriptor);
        self.state = PairingState::DescriptorCaptured;
        Ok(())
    }

    /// `DescriptorCaptured | NamingDevice -> NamingDevice`
    ///
    /// `taken` tells whether the name already belongs to another inbound
    /// device. A rejected name leaves the flow in `NamingDevice` with no
    /// accepted name.
    pub fn propose_name(&mut self, name: &str, taken: bool) -> Result<()> {
        self.expect(
            &[PairingState::DescriptorCaptured, PairingState::NamingDevice],
            "DescriptorCaptured or NamingDevice",
        )?;
        self.state = PairingState::NamingDevice;
        self.name = None;

        validate_name(name)?;
        if taken {
            return Err(ValidationError::NameInUse(name.to_string()).into());
        }

        self.name = Some(name.to_string());
        Ok(())
    }

    /// `NamingDevice -> PublishingOrResolving`, requires an accepted name
    pub fn begin_exchange(&mut self) -> Result<()> {
        if self.state != PairingState::NamingDevice || self.name.is_none() {
            return Err(self.invalid("NamingDevice with an accepted name"));
        }
        self.state = PairingState::PublishingOrResolving;
        Ok(())
    }

    /// `PublishingOrResolving -> NamingDevice`
    ///
    /// Used when the accepted name was claimed by another record before the
    /// commit. The captured descriptor is kept; the name must be proposed
    /// again.
    pub fn reopen_naming(&mut self) -> Result<()> {
        self.expect(&[PairingState::PublishingOrResolving], "PublishingOrResolving")?;
        self.state = PairingState::NamingDevice;
        self.name = None;
        Ok(())
    }

    /// Record that [`Self::commit`] would produce, without transitioning
    pub fn pending_device(&self, now: DateTime<Utc>) -> Result<PairedDevice> {
        self.expect(&[PairingState::PublishingOrResolving], "PublishingOrResolving")?;

        match (&self.descriptor, &self.name) {
            (Some(descriptor), Some(name)) => Ok(PairedDevice::with_created_at(
                descriptor.device_type.clone(),
                name.clone(),
                self.role,
                descriptor.secret.clone(),
                now,
            )),
            _ => Err(self.invalid("PublishingOrResolving with descriptor and name")),
        }
    }

    /// `PublishingOrResolving -> Committed`
    pub fn commit(&mut self, now: DateTime<Utc>) -> Result<PairedDevice> {
        let device = self.pending_device(now)?;
        self.state = PairingState::Committed;
        Ok(device)
    }

    /// Move to `Aborted` from any non-terminal state
    ///
    /// Returns `false` (and changes nothing) if the flow had already ended.
    pub fn abort(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = PairingState::Aborted;
        self.abort_reason = Some(reason.into());
        true
    }

    fn expect(&self, allowed: &[PairingState], expected: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(expected))
        }
    }

    fn invalid(&self, expected: &str) -> ProtocolError {
        ProtocolError::InvalidState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }
}
