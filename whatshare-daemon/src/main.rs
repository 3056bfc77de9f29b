mod cli;
mod config;
mod presenter;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use whatshare_protocol::forward::{open_from_inbound, seal_for_outbound};
use whatshare_protocol::pairing::{PairingOutcome, PairingService};
use whatshare_protocol::registry::{DeviceRegistry, DeviceSelector, JsonFileStore};
use whatshare_protocol::relay::UrlShortenerRelay;
use whatshare_protocol::{DeviceRole, PairedDevice, ProtocolError};

use cli::{Cli, Command};
use config::Config;

/// Line-based prompts on stdin
struct Prompt {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompt {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn ask(&mut self, question: &str) -> Result<String> {
        eprint!("{}: ", question);
        std::io::stderr().flush().ok();

        let line = self
            .lines
            .next_line()
            .await
            .context("Failed to read input")?
            .context("Input closed")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn value_or_ask(&mut self, value: Option<String>, question: &str) -> Result<String> {
        match value {
            Some(value) => Ok(value),
            None => self.ask(question).await,
        }
    }
}

/// Main daemon state
struct Daemon {
    /// Configuration
    config: Config,

    /// Paired devices
    registry: Arc<DeviceRegistry>,
}

impl Daemon {
    /// Create a new daemon
    fn new(config: Config) -> Result<Self> {
        let registry = DeviceRegistry::open(JsonFileStore::new(&config.paths.registry_file))
            .with_context(|| {
                format!(
                    "Failed to load device registry {}",
                    config.paths.registry_file.display()
                )
            })?;

        Ok(Self {
            config,
            registry: Arc::new(registry),
        })
    }

    fn pairing_service(&self) -> Result<PairingService> {
        let relay = UrlShortenerRelay::new(self.config.shortener_config()?, self.config.retry.policy())
            .context("Failed to create relay client")?;

        Ok(PairingService::new(
            self.config.pairing_config(),
            Arc::new(relay),
            self.registry.clone(),
        ))
    }

    /// Run one handshake, cancelling it on Ctrl-C
    async fn pair(&self, role: DeviceRole, scan: Option<String>, name: Option<String>) -> Result<()> {
        let service = self.pairing_service()?;
        let presenter = presenter::spawn(service.subscribe());
        let mut prompt = Prompt::new();

        let result = tokio::select! {
            result = drive(&service, &mut prompt, role, scan, name) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, cancelling {} pairing", role);
                service.cancel(role).await;
                Err(ProtocolError::Aborted("interrupted".to_string()).into())
            }
        };

        // Closing the event channel lets the presenter drain and exit
        drop(service);
        presenter.await.ok();

        let outcome = result?;
        info!(
            "Pairing complete: {} device '{}' ({})",
            outcome.device.role,
            outcome.device.name,
            outcome.device.secret.fingerprint()
        );
        Ok(())
    }

    fn list(&self, role: Option<DeviceRole>, json: bool) -> Result<()> {
        let devices: Vec<PairedDevice> = match role {
            Some(role) => self.registry.list(role),
            None => {
                let mut all = self.registry.list(DeviceRole::Outbound);
                all.extend(self.registry.list(DeviceRole::Inbound));
                all
            }
        };

        if json {
            let redacted: Vec<_> = devices
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "type": d.device_type,
                        "name": d.name,
                        "role": d.role,
                        "fingerprint": d.secret.fingerprint(),
                        "createdAt": d.created_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&redacted)?);
            return Ok(());
        }

        if devices.is_empty() {
            eprintln!("No paired devices");
            return Ok(());
        }

        for device in devices {
            println!(
                "{:<8} {:<32} {:<20} {} {}",
                device.role,
                device.name,
                device.device_type,
                device.secret.fingerprint(),
                device
                    .created_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
            );
        }
        Ok(())
    }

    fn unpair(&self, name: Option<String>, outbound: bool) -> Result<()> {
        let selector = match (name, outbound) {
            (_, true) => DeviceSelector::Outbound,
            (Some(name), false) => DeviceSelector::Inbound(name),
            (None, false) => bail!("Specify a device name or --outbound"),
        };

        match self.registry.remove(&selector) {
            Ok(device) => {
                eprintln!("Removed {} device '{}'", device.role, device.name);
                Ok(())
            }
            Err(ProtocolError::NotFound(what)) => {
                warn!("Nothing to unpair: {}", what);
                eprintln!("No {} is paired", what);
                Ok(())
            }
            Err(e) => Err(e).context("Failed to update device registry"),
        }
    }

    async fn seal(&self) -> Result<()> {
        let mut payload = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut payload)
            .await
            .context("Failed to read payload")?;

        let sealed = seal_for_outbound(&self.registry, &payload)
            .map_err(|e| anyhow::anyhow!(e.user_message()))?;
        println!("{}", STANDARD.encode(sealed));
        Ok(())
    }

    async fn open(&self, from: &str) -> Result<()> {
        let mut encoded = String::new();
        tokio::io::stdin()
            .read_to_string(&mut encoded)
            .await
            .context("Failed to read payload")?;

        let sealed = STANDARD
            .decode(encoded.trim())
            .context("Payload is not valid base64")?;
        let payload = open_from_inbound(&self.registry, from, &sealed)
            .map_err(|e| anyhow::anyhow!(e.user_message()))?;

        std::io::stdout()
            .write_all(&payload)
            .context("Failed to write payload")?;
        Ok(())
    }

    fn dump_config(&self) -> Result<()> {
        let contents = toml::to_string_pretty(&self.config.redacted())
            .context("Failed to serialize config")?;
        println!("{}", contents);
        Ok(())
    }
}

/// Walk the handshake for `role`, prompting for whatever was not given
///
/// `scan` is the scanned QR payload (inbound only).
async fn drive(
    service: &PairingService,
    prompt: &mut Prompt,
    role: DeviceRole,
    scan: Option<String>,
    name: Option<String>,
) -> Result<PairingOutcome> {
    match role {
        DeviceRole::Inbound => {
            service.start_inbound().await?;
            let mut payload = prompt.value_or_ask(scan, "Scanned QR payload").await?;
            loop {
                match service.submit_scan(&payload).await {
                    Ok(_) => break,
                    Err(ProtocolError::Decode(e)) => {
                        eprintln!("Unreadable QR payload: {}", e);
                        payload = prompt.ask("Scanned QR payload").await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        DeviceRole::Outbound => {
            let shown = service.start_outbound().await?;
            println!("{}", shown.to_qr_payload()?);
            eprintln!(
                "Scan this as a QR code on the other device. Secret fingerprint: {}",
                shown.secret.fingerprint()
            );
            std::io::stdout().flush().ok();

            let code = prompt.ask("Pairing code").await?;
            service.submit_code(&code).await?;
        }
    }

    let mut name = prompt.value_or_ask(name, "Device name").await?;
    loop {
        match service.submit_name(role, &name).await {
            Ok(outcome) => return Ok(outcome),
            Err(ProtocolError::Validation(_)) => {
                // The presenter already showed the reason
                name = prompt.ask("Device name").await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_logging(&cli)?;

    let config = Config::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Device type: {}", config.device.device_type);

    let daemon = Daemon::new(config)?;

    match cli.command {
        Command::PairInbound { scan, name } => daemon.pair(DeviceRole::Inbound, scan, name).await,
        Command::PairOutbound { name } => daemon.pair(DeviceRole::Outbound, None, name).await,
        Command::List { role, json } => daemon.list(role.map(DeviceRole::from), json),
        Command::Unpair { name, outbound } => daemon.unpair(name, outbound),
        Command::Seal => daemon.seal().await,
        Command::Open { from } => daemon.open(&from).await,
        Command::DumpConfig => daemon.dump_config(),
    }
}
