//! Pairing Event System
//!
//! This module defines events emitted during the pairing process for the
//! presentation layer.

use super::flow::PairingState;
use crate::device::{DeviceRole, PairedDevice};
use crate::error::ValidationError;
use crate::relay::PairingCode;

/// Input the user is expected to provide next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Scan the counterpart's QR code
    ScanQrCode,
    /// Type the pairing code shown on the counterpart
    PairingCode,
    /// Choose a name for the counterpart
    DeviceName,
}

/// Events emitted by the pairing service
#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// Handshake state changed
    StateChanged {
        /// Handshake role
        role: DeviceRole,
        /// New state
        state: PairingState,
    },

    /// User input is needed to continue
    AwaitingInput {
        /// Handshake role
        role: DeviceRole,
        /// What to ask for
        input: InputKind,
    },

    /// The proposed device name was rejected; prompt again
    ValidationFailed {
        /// Handshake role
        role: DeviceRole,
        /// Field-level error
        error: ValidationError,
    },

    /// The relay minted a code to show to the user
    CodeIssued {
        /// Handshake role
        role: DeviceRole,
        /// Code to display
        code: PairingCode,
    },

    /// Pairing stored in the registry
    Paired {
        /// The new record
        device: PairedDevice,
    },

    /// Handshake aborted
    Failed {
        /// Handshake role
        role: DeviceRole,
        /// User-facing reason
        reason: String,
        /// Whether starting a new handshake may succeed
        retryable: bool,
    },
}

impl PairingEvent {
    /// Check if this is a paired event
    pub fn is_paired(&self) -> bool {
        matches!(self, PairingEvent::Paired { .. })
    }

    /// Check if this is a failure event
    pub fn is_failed(&self) -> bool {
        matches!(self, PairingEvent::Failed { .. })
    }

    /// Role of the handshake this event belongs to
    pub fn role(&self) -> DeviceRole {
        match self {
            PairingEvent::StateChanged { role, .. } => *role,
            PairingEvent::AwaitingInput { role, .. } => *role,
            PairingEvent::ValidationFailed { role, .. } => *role,
            PairingEvent::CodeIssued { role, .. } => *role,
            PairingEvent::Paired { device } => device.role,
            PairingEvent::Failed { role, .. } => *role,
        }
    }
}
