//! Adapter connection shared by the commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use opendiag_core::config::parse_hex_u32;
use opendiag_core::security::AlgorithmRegistry;
use opendiag_core::transport::DeviceClass;
use opendiag_core::uds::RequestPolicy;
use opendiag_core::{
    create_transport, BidirectionalControlService, DeviceDescriptor, OpenDiagConfig,
    SecurityAccessManager, Transport, UdsClient, VehicleModule,
};

const DEVICE_SCAN_TIMEOUT: Duration = Duration::from_secs(3);

/// Parse a module address such as `7E0` or `0x18DA10F1`
pub fn parse_address(value: &str) -> Result<u32> {
    parse_hex_u32("address", value).with_context(|| format!("Invalid module address '{}'", value))
}

/// Parse hex bytes, tolerating spaces and a `0x` prefix
pub fn parse_hex_bytes(value: &str) -> Result<Vec<u8>> {
    let compact: String = value
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    hex::decode(&compact).with_context(|| format!("Invalid hex bytes '{}'", value))
}

/// A connected adapter plus the diagnostic services on top of it
pub struct Connection {
    pub config: OpenDiagConfig,
    pub transport: Arc<dyn Transport>,
    pub device: DeviceDescriptor,
    pub security: Arc<SecurityAccessManager>,
    pub control: BidirectionalControlService,
    disconnect_watch: JoinHandle<()>,
}

impl Connection {
    /// Scan for adapters and connect to `device`, or the first one found
    pub async fn open(config: OpenDiagConfig, device: Option<&str>) -> Result<Self> {
        let transport =
            create_transport(&config.transport).context("Failed to create transport")?;
        let device = select_device(transport.as_ref(), device).await?;

        info!(device = %device.id, kind = ?transport.kind(), "Connecting");
        transport
            .connect(&device)
            .await
            .with_context(|| format!("Failed to connect to {}", device.id))?;

        let client = UdsClient::new(transport.clone(), RequestPolicy::from_config(&config.session));
        let security = Arc::new(SecurityAccessManager::new(
            client,
            AlgorithmRegistry::with_defaults(),
            &config.security,
        ));
        let disconnect_watch = security.spawn_disconnect_watch();
        let control =
            BidirectionalControlService::new(security.clone(), &config.session, &config.security);

        Ok(Self {
            config,
            transport,
            device,
            security,
            control,
            disconnect_watch,
        })
    }

    pub fn client(&self) -> &UdsClient {
        self.security.client()
    }

    /// Module handle for `address`, with session and unlock state applied
    pub fn module(&self, address: u32) -> VehicleModule {
        let mut module = VehicleModule::at(address);
        self.security.sync(&mut module);
        module
    }

    pub async fn close(self) -> Result<()> {
        self.disconnect_watch.abort();
        self.transport
            .disconnect()
            .await
            .context("Failed to disconnect")?;
        debug!(device = %self.device.id, "Disconnected");
        Ok(())
    }
}

async fn select_device(transport: &dyn Transport, wanted: Option<&str>) -> Result<DeviceDescriptor> {
    let devices = transport
        .scan(DEVICE_SCAN_TIMEOUT)
        .await
        .context("Device scan failed")?;

    match wanted {
        Some(id) => Ok(devices
            .into_iter()
            .find(|d| d.id == id)
            .unwrap_or_else(|| DeviceDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                class: DeviceClass::Unclassified,
                signal_quality: None,
                description: "Given on the command line".to_string(),
            })),
        None => match devices.into_iter().next() {
            Some(device) => Ok(device),
            None => bail!("No adapter found; pass --device or check the [transport] endpoints"),
        },
    }
}
