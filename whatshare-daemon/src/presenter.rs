//! Terminal presentation of pairing events

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use whatshare_protocol::pairing::InputKind;
use whatshare_protocol::PairingEvent;

/// Print events until the service is dropped
pub fn spawn(mut events: broadcast::Receiver<PairingEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    // The code is the command's output
                    if let PairingEvent::CodeIssued { code, .. } = &event {
                        println!("{}", code);
                    }
                    match describe(&event) {
                        Some(line) => eprintln!("{}", line),
                        None => debug!("{} pairing event: {:?}", event.role(), event),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Presenter skipped {} pairing events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// User-facing line for an event, if it deserves one
fn describe(event: &PairingEvent) -> Option<String> {
    match event {
        PairingEvent::AwaitingInput { input, .. } => Some(
            match input {
                InputKind::ScanQrCode => "Waiting for the counterpart's QR code",
                InputKind::PairingCode => "Waiting for the pairing code",
                InputKind::DeviceName => "Choose a name for the counterpart",
            }
            .to_string(),
        ),
        PairingEvent::ValidationFailed { error, .. } => Some(format!("Invalid name: {}", error)),
        PairingEvent::CodeIssued { code, role } => {
            Some(format!("Pairing code for {} device: {}", role, code))
        }
        PairingEvent::Paired { device } => Some(format!(
            "Paired {} device '{}' ({})",
            device.role, device.name, device.device_type
        )),
        PairingEvent::Failed {
            reason, retryable, ..
        } => Some(if *retryable {
            format!("Pairing failed: {} You can try again.", reason)
        } else {
            format!("Pairing failed: {}", reason)
        }),
        PairingEvent::StateChanged { .. } => None,
    }
}
