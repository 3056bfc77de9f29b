//! Pairing Service
//!
//! Drives one pairing handshake per role. Inbound and outbound handshakes are
//! independent and may run in parallel.
//!
//! Relay calls are the only suspension points. The slot lock is released
//! while a call is in flight; when the response arrives the slot is checked
//! again and the response is discarded if the handshake was cancelled or
//! superseded in the meantime.

use super::events::{InputKind, PairingEvent};
use super::flow::{PairingFlow, PairingState};
use crate::descriptor::PairingDescriptor;
use crate::device::{DeviceRole, PairedDevice};
use crate::registry::DeviceRegistry;
use crate::error::ValidationError;
use crate::relay::{PairingCode, RelayClient, RetryPolicy};
use crate::secret::SharedSecret;
use crate::{ProtocolError, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Pairing service configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Model of this device, published to inbound counterparts
    pub device_type: String,

    /// Outer deadline for each relay call
    pub handshake_deadline: Option<Duration>,

    /// Retry policy used by the relay client
    ///
    /// The handshake deadline is never shorter than its total backoff window.
    pub retry: RetryPolicy,
}

impl PairingConfig {
    pub fn new(device_type: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            handshake_deadline: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a completed handshake
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    /// The committed record
    pub device: PairedDevice,

    /// Code to show to the user (inbound only)
    pub code: Option<PairingCode>,
}

#[derive(Debug)]
struct Slot {
    flow: PairingFlow,
    handshake: u64,
    /// Secret shown in this device's QR code (outbound)
    shown: Option<SharedSecret>,
    /// Code already minted by the relay (inbound)
    code: Option<PairingCode>,
}

/// Pairing service for managing device pairing
pub struct PairingService {
    config: PairingConfig,

    /// Effective relay deadline
    deadline: Option<Duration>,

    relay: Arc<dyn RelayClient>,

    registry: Arc<DeviceRegistry>,

    /// Current handshake per role
    slots: RwLock<HashMap<DeviceRole, Slot>>,

    /// Codes already resolved by this device
    consumed_codes: RwLock<HashSet<PairingCode>>,

    next_handshake: AtomicU64,

    event_tx: broadcast::Sender<PairingEvent>,
}

impl PairingService {
    /// Create a new pairing service
    pub fn new(
        config: PairingConfig,
        relay: Arc<dyn RelayClient>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        let deadline = config.handshake_deadline.map(|deadline| {
            let window = config.retry.total_backoff();
            if deadline < window {
                warn!(
                    "Handshake deadline {:?} is shorter than the relay retry window, using {:?}",
                    deadline, window
                );
                window
            } else {
                deadline
            }
        });

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            deadline,
            relay,
            registry,
            slots: RwLock::new(HashMap::new()),
            consumed_codes: RwLock::new(HashSet::new()),
            next_handshake: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Get a receiver for pairing events
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Deadline actually applied to relay calls
    pub fn handshake_deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Current state of the handshake for `role`
    pub async fn state(&self, role: DeviceRole) -> PairingState {
        self.slots
            .read()
            .await
            .get(&role)
            .map(|slot| slot.flow.state())
            .unwrap_or(PairingState::Idle)
    }

    /// Begin pairing a device that will send content here
    ///
    /// The next step is [`Self::submit_scan`].
    pub async fn start_inbound(&self) -> Result<()> {
        self.start(DeviceRole::Inbound, None).await
    }

    /// Begin pairing the desktop this device forwards content to
    ///
    /// Returns the descriptor to show as a QR code, carrying a fresh secret.
    /// The next step is [`Self::submit_code`] with the code the counterpart
    /// shows after scanning it.
    pub async fn start_outbound(&self) -> Result<PairingDescriptor> {
        self.start_outbound_with(SharedSecret::generate()?).await
    }

    /// Like [`Self::start_outbound`], showing `secret` instead of a fresh one
    pub async fn start_outbound_with(&self, secret: SharedSecret) -> Result<PairingDescriptor> {
        let shown = PairingDescriptor::new(self.config.device_type.clone(), secret);
        self.start(DeviceRole::Outbound, Some(shown.secret.clone()))
            .await?;
        Ok(shown)
    }

    async fn start(&self, role: DeviceRole, shown: Option<SharedSecret>) -> Result<()> {
        let mut slots = self.slots.write().await;

        if let Some(slot) = slots.get_mut(&role) {
            if slot.flow.state() == PairingState::PublishingOrResolving {
                warn!("Rejecting new {} pairing: exchange in progress", role);
                return Err(ProtocolError::PairingInProgress(role));
            }
            if slot.flow.abort("superseded") {
                info!("Superseding {} pairing handshake {}", role, slot.handshake);
                self.emit(PairingEvent::StateChanged {
                    role,
                    state: PairingState::Aborted,
                });
            }
        }

        let mut flow = PairingFlow::new(role);
        flow.start()?;
        let handshake = self.next_handshake.fetch_add(1, Ordering::SeqCst) + 1;
        slots.insert(
            role,
            Slot {
                flow,
                handshake,
                shown,
                code: None,
            },
        );

        info!("Started {} pairing handshake {}", role, handshake);
        self.emit(PairingEvent::StateChanged {
            role,
            state: PairingState::AwaitingScan,
        });
        self.emit(PairingEvent::AwaitingInput {
            role,
            input: match role {
                DeviceRole::Inbound => InputKind::ScanQrCode,
                DeviceRole::Outbound => InputKind::PairingCode,
            },
        });

        Ok(())
    }

    /// Hand over the text decoded from the counterpart's QR code
    ///
    /// An unreadable payload keeps the handshake waiting for another scan.
    pub async fn submit_scan(&self, payload: &str) -> Result<PairingDescriptor> {
        let role = DeviceRole::Inbound;
        let mut slots = self.slots.write().await;
        let slot = Self::slot_in(&mut slots, role, PairingState::AwaitingScan)?;

        let descriptor = match PairingDescriptor::from_qr_payload(payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Unreadable pairing QR code: {}", e);
                self.emit(PairingEvent::AwaitingInput {
                    role,
                    input: InputKind::ScanQrCode,
                });
                return Err(e);
            }
        };

        slot.flow.capture(descriptor.clone())?;
        info!(
            "Captured {} descriptor ({})",
            descriptor.device_type,
            descriptor.secret.fingerprint()
        );
        self.emit_captured(role);

        Ok(descriptor)
    }

    /// Resolve the pairing code the user typed
    ///
    /// Unknown, expired and already used codes abort the handshake, as does a
    /// relay that stays unreachable after retries. A code whose descriptor
    /// does not carry the secret shown by [`Self::start_outbound`] aborts with
    /// `Authentication`.
    pub async fn submit_code(&self, input: &str) -> Result<PairingDescriptor> {
        let role = DeviceRole::Outbound;
        let handshake = {
            let mut slots = self.slots.write().await;
            Self::slot_in(&mut slots, role, PairingState::AwaitingScan)?.handshake
        };

        let code = match PairingCode::parse(input) {
            Ok(code) => code,
            Err(e) => return self.fail(role, handshake, e).await,
        };

        if !self.consumed_codes.write().await.insert(code.clone()) {
            warn!("Pairing code {} was already used", code);
            let e = ProtocolError::CodeNotFound(format!("{} (already used)", code));
            return self.fail(role, handshake, e).await;
        }

        debug!("Resolving pairing code {} for handshake {}", code, handshake);
        let result = self.with_deadline(self.relay.resolve(&code)).await;

        let mut slots = self.slots.write().await;
        let Some(slot) = Self::current(&mut slots, role, handshake, PairingState::AwaitingScan)
        else {
            warn!("Discarding relay response for cancelled {} pairing", role);
            self.consumed_codes.write().await.remove(&code);
            return Err(ProtocolError::Aborted(
                "handshake cancelled or superseded".to_string(),
            ));
        };

        match result {
            Ok(descriptor) => {
                let authentic = slot
                    .shown
                    .as_ref()
                    .is_some_and(|shown| shown.matches(&descriptor.secret));
                if !authentic {
                    warn!(
                        "Pairing code {} carries a secret this device did not show ({})",
                        code,
                        descriptor.secret.fingerprint()
                    );
                    let e = ProtocolError::Authentication;
                    self.abort_flow(slot, &e);
                    return Err(e);
                }

                slot.flow.capture(descriptor.clone())?;
                info!(
                    "Pairing code {} resolved to a {} descriptor ({})",
                    code,
                    descriptor.device_type,
                    descriptor.secret.fingerprint()
                );
                self.emit_captured(role);
                Ok(descriptor)
            }
            Err(e) => {
                if !matches!(e, ProtocolError::CodeNotFound(_)) {
                    self.consumed_codes.write().await.remove(&code);
                }
                self.abort_flow(slot, &e);
                Err(e)
            }
        }
    }

    /// Name the counterpart and complete the handshake
    ///
    /// An invalid name is reported without touching the relay; the handshake
    /// keeps waiting for a name. Inbound handshakes then publish this
    /// device's descriptor and commit once the relay returns a code; outbound
    /// handshakes commit right away.
    pub async fn submit_name(&self, role: DeviceRole, name: &str) -> Result<PairingOutcome> {
        let taken = role == DeviceRole::Inbound && self.registry.inbound(name).is_some();

        let (handshake, captured, issued) = {
            let mut slots = self.slots.write().await;
            let slot = slots.get_mut(&role).ok_or_else(|| no_handshake(role))?;

            match slot.flow.propose_name(name, taken) {
                Ok(()) => {}
                Err(ProtocolError::Validation(error)) => {
                    debug!("Rejected {} device name {:?}: {}", role, name, error);
                    self.emit(PairingEvent::ValidationFailed {
                        role,
                        error: error.clone(),
                    });
                    self.emit(PairingEvent::AwaitingInput {
                        role,
                        input: InputKind::DeviceName,
                    });
                    return Err(ProtocolError::Validation(error));
                }
                Err(e) => return Err(e),
            }

            slot.flow.begin_exchange()?;
            let captured = slot
                .flow
                .descriptor()
                .cloned()
                .ok_or_else(|| no_handshake(role))?;

            self.emit(PairingEvent::StateChanged {
                role,
                state: PairingState::PublishingOrResolving,
            });
            (slot.handshake, captured, slot.code.clone())
        };

        match role {
            DeviceRole::Inbound => self.publish_and_commit(handshake, captured, issued).await,
            DeviceRole::Outbound => self.commit_outbound(handshake).await,
        }
    }

    /// Abort the handshake for `role`
    ///
    /// Returns `false` if there was nothing to cancel.
    pub async fn cancel(&self, role: DeviceRole) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(&role) else {
            return false;
        };

        if !slot.flow.abort("cancelled") {
            return false;
        }

        info!("Cancelled {} pairing handshake {}", role, slot.handshake);
        self.emit(PairingEvent::StateChanged {
            role,
            state: PairingState::Aborted,
        });
        self.emit(PairingEvent::Failed {
            role,
            reason: ProtocolError::Aborted("cancelled".to_string()).user_message(),
            retryable: true,
        });
        true
    }

    async fn publish_and_commit(
        &self,
        handshake: u64,
        captured: PairingDescriptor,
        issued: Option<PairingCode>,
    ) -> Result<PairingOutcome> {
        let role = DeviceRole::Inbound;

        let result = match issued {
            Some(code) => {
                debug!("Reusing pairing code {} for handshake {}", code, handshake);
                Ok(code)
            }
            None => {
                let local =
                    PairingDescriptor::new(self.config.device_type.clone(), captured.secret);
                debug!("Publishing {} descriptor for handshake {}", local.device_type, handshake);
                self.with_deadline(self.relay.publish(&local)).await
            }
        };

        let mut slots = self.slots.write().await;
        let Some(slot) =
            Self::current(&mut slots, role, handshake, PairingState::PublishingOrResolving)
        else {
            warn!("Discarding relay response for cancelled {} pairing", role);
            return Err(ProtocolError::Aborted(
                "handshake cancelled or superseded".to_string(),
            ));
        };

        let code = match result {
            Ok(code) => code,
            Err(e) => {
                self.abort_flow(slot, &e);
                return Err(e);
            }
        };

        slot.code = Some(code.clone());

        let device = match self.commit_slot(slot, |device| self.registry.insert_inbound(device)) {
            Ok(device) => device,
            Err(ProtocolError::DuplicateName(name)) => {
                // The name is not part of the published descriptor, so the
                // code stays valid; only the name is asked for again
                warn!("Inbound name '{}' was taken during the exchange", name);
                slot.flow.reopen_naming()?;
                let error = ValidationError::NameInUse(name);
                self.emit(PairingEvent::StateChanged {
                    role,
                    state: PairingState::NamingDevice,
                });
                self.emit(PairingEvent::ValidationFailed {
                    role,
                    error: error.clone(),
                });
                self.emit(PairingEvent::AwaitingInput {
                    role,
                    input: InputKind::DeviceName,
                });
                return Err(ProtocolError::Validation(error));
            }
            Err(e) => {
                self.abort_flow(slot, &e);
                return Err(e);
            }
        };

        self.emit(PairingEvent::CodeIssued {
            role,
            code: code.clone(),
        });
        self.emit_committed(&device);

        Ok(PairingOutcome {
            device,
            code: Some(code),
        })
    }

    async fn commit_outbound(&self, handshake: u64) -> Result<PairingOutcome> {
        let role = DeviceRole::Outbound;
        let mut slots = self.slots.write().await;
        let Some(slot) =
            Self::current(&mut slots, role, handshake, PairingState::PublishingOrResolving)
        else {
            return Err(ProtocolError::Aborted(
                "handshake cancelled or superseded".to_string(),
            ));
        };

        let device = match self.commit_slot(slot, |device| {
            self.registry.upsert_outbound(device).map(|_| ())
        }) {
            Ok(device) => device,
            Err(e) => {
                self.abort_flow(slot, &e);
                return Err(e);
            }
        };
        self.emit_committed(&device);

        Ok(PairingOutcome { device, code: None })
    }

    /// Store the pending record, then mark the flow committed
    ///
    /// On a store error the flow is left in `PublishingOrResolving` for the
    /// caller to abort or reopen.
    fn commit_slot(
        &self,
        slot: &mut Slot,
        store: impl FnOnce(PairedDevice) -> Result<()>,
    ) -> Result<PairedDevice> {
        let now = Utc::now();
        let pending = slot.flow.pending_device(now)?;
        store(pending)?;

        let device = slot.flow.commit(now)?;
        info!(
            "Paired {} device '{}' ({})",
            device.role, device.name, device.device_type
        );
        Ok(device)
    }

    async fn fail<T>(&self, role: DeviceRole, handshake: u64, error: ProtocolError) -> Result<T> {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(&role) {
            if slot.handshake == handshake {
                self.abort_flow(slot, &error);
            }
        }
        Err(error)
    }

    fn abort_flow(&self, slot: &mut Slot, error: &ProtocolError) {
        let role = slot.flow.role();
        if slot.flow.abort(error.to_string()) {
            error!("{} pairing handshake {} aborted: {}", role, slot.handshake, error);
            self.emit(PairingEvent::StateChanged {
                role,
                state: PairingState::Aborted,
            });
            self.emit(PairingEvent::Failed {
                role,
                reason: error.user_message(),
                retryable: error.is_recoverable(),
            });
        }
    }

    async fn with_deadline<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, call).await.map_err(|_| {
                ProtocolError::Timeout(format!("No relay response within {:?}", deadline))
            })?,
            None => call.await,
        }
    }

    fn emit_captured(&self, role: DeviceRole) {
        self.emit(PairingEvent::StateChanged {
            role,
            state: PairingState::DescriptorCaptured,
        });
        self.emit(PairingEvent::AwaitingInput {
            role,
            input: InputKind::DeviceName,
        });
    }

    fn emit_committed(&self, device: &PairedDevice) {
        self.emit(PairingEvent::StateChanged {
            role: device.role,
            state: PairingState::Committed,
        });
        self.emit(PairingEvent::Paired {
            device: device.clone(),
        });
    }

    fn emit(&self, event: PairingEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }

    fn slot_in(
        slots: &mut HashMap<DeviceRole, Slot>,
        role: DeviceRole,
        expected: PairingState,
    ) -> Result<&mut Slot> {
        let slot = slots.get_mut(&role).ok_or_else(|| no_handshake(role))?;
        if slot.flow.state() != expected {
            return Err(ProtocolError::InvalidState {
                expected: expected.to_string(),
                actual: slot.flow.state().to_string(),
            });
        }
        Ok(slot)
    }

    fn current(
        slots: &mut HashMap<DeviceRole, Slot>,
        role: DeviceRole,
        handshake: u64,
        expected: PairingState,
    ) -> Option<&mut Slot> {
        slots
            .get_mut(&role)
            .filter(|slot| slot.handshake == handshake && slot.flow.state() == expected)
    }
}

fn no_handshake(role: DeviceRole) -> ProtocolError {
    ProtocolError::InvalidState {
        expected: format!("started {} handshake", role),
        actual: PairingState::Idle.to_string(),
    }
}
