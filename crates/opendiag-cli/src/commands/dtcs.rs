//! DTC commands - read and clear trouble codes on one module

use anyhow::{Context, Result};

use opendiag_core::ModuleScanner;

use crate::connection::Connection;
use crate::output::{DtcRow, OutputContext};

fn scanner(conn: &Connection) -> Result<ModuleScanner> {
    ModuleScanner::new(
        conn.transport.clone(),
        &conn.config.scanner,
        &conn.config.session,
    )
    .context("Invalid scanner configuration")
}

pub async fn dtcs(conn: &Connection, address: u32, ctx: &OutputContext) -> Result<()> {
    let mut module = conn.module(address);
    scanner(conn)?
        .read_module_dtcs(&mut module)
        .await
        .with_context(|| format!("Reading DTCs from {} failed", module))?;

    if module.dtcs.is_empty() {
        ctx.success(&format!("No DTCs stored in {}", module));
        return Ok(());
    }
    let rows: Vec<DtcRow> = module.dtcs.iter().map(DtcRow::from).collect();
    ctx.print(&rows);
    Ok(())
}

pub async fn clear_dtcs(conn: &Connection, address: u32, ctx: &OutputContext) -> Result<()> {
    let mut module = conn.module(address);
    scanner(conn)?
        .clear_dtcs(&mut module)
        .await
        .with_context(|| format!("Clearing DTCs on {} failed", module))?;
    ctx.success(&format!("DTCs cleared on {}", module));
    Ok(())
}
