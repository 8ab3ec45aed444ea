//! Devices command - adapter discovery

use std::time::Duration;

use anyhow::{Context, Result};

use opendiag_core::{create_transport, OpenDiagConfig};

use crate::output::{DeviceRow, OutputContext};

/// Scan for adapters reachable through the configured transport
pub async fn devices(config: &OpenDiagConfig, timeout: Duration, ctx: &OutputContext) -> Result<()> {
    let transport = create_transport(&config.transport).context("Failed to create transport")?;
    ctx.info(&format!("Scanning for {:?} adapters...", transport.kind()));

    let found = transport.scan(timeout).await.context("Device scan failed")?;
    let rows: Vec<DeviceRow> = found.iter().map(DeviceRow::from).collect();
    ctx.print(&rows);
    Ok(())
}
