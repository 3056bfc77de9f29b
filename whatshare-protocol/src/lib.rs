//! Whatshare Pairing Core
//!
//! Pairs a mobile device with a desktop counterpart over an untrusted
//! out-of-band channel (a QR code plus a URL shortener used as a one-shot
//! relay) and uses the resulting shared secret to seal forwarded payloads.

pub mod descriptor;
pub mod device;
pub mod forward;
pub mod pairing;
pub mod registry;
pub mod relay;
pub mod secret;

mod error;
pub use descriptor::PairingDescriptor;
pub use device::{DeviceRole, PairedDevice};
pub use error::{ProtocolError, Result, ValidationError};
pub use pairing::{PairingEvent, PairingService, PairingState};
pub use registry::{DeviceRegistry, DeviceSelector};
pub use relay::{PairingCode, RelayClient};
pub use secret::SharedSecret;

