//! Device Pairing
//!
//! Establishes a shared secret between this device and a counterpart over an
//! untrusted out-of-band channel.
//!
//! ## Pairing Protocol
//!
//! 1. **Descriptor**: Device A starts an outbound handshake and shows a QR code carrying `{deviceType, secret}`
//! 2. **Scan**: Device B scans it and starts an inbound handshake
//! 3. **Naming**: The user names device A on device B
//! 4. **Publish**: Device B publishes `{its own deviceType, secret}` to the relay and shows the returned code
//! 5. **Resolve**: The user types the code on device A, which resolves it and checks that it carries the secret A showed
//! 6. **Commit**: Both sides store a [`PairedDevice`](crate::PairedDevice) keyed by the same secret
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use whatshare_protocol::pairing::{PairingConfig, PairingService};
//! use whatshare_protocol::registry::DeviceRegistry;
//! use whatshare_protocol::relay::MemoryRelay;
//! use whatshare_protocol::DeviceRole;
//!
//! #[tokio::main]
//! async fn main() -> whatshare_protocol::Result<()> {
//!     let service = PairingService::new(
//!         PairingConfig::new("Pixel"),
//!         Arc::new(MemoryRelay::new()),
//!         Arc::new(DeviceRegistry::in_memory()),
//!     );
//!
//!     let shown = service.start_outbound().await?;
//!     println!("Scan this: {}", shown.to_qr_payload()?);
//!
//!     service.submit_code("ab12").await?;
//!     let outcome = service.submit_name(DeviceRole::Outbound, "kitchen-pc").await?;
//!     println!("Paired with {}", outcome.device.name);
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod flow;
pub mod service;

pub use events::{InputKind, PairingEvent};
pub use flow::{PairingFlow, PairingState};
pub use service::{PairingConfig, PairingOutcome, PairingService};
