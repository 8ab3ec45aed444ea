//! Control commands - DID writes, I/O control and routines

use anyhow::{anyhow, Context, Result};

use opendiag_core::ControlCatalog;

use crate::connection::{parse_hex_bytes, Connection};
use crate::output::{ControlRow, OutputContext};

fn catalog(conn: &Connection) -> Result<ControlCatalog> {
    ControlCatalog::from_config(&conn.config).context("Invalid actuator or routine configuration")
}

/// WriteDataByIdentifier; unlocks the configured write level first
pub async fn write(
    conn: &Connection,
    address: u32,
    did: u16,
    value: &str,
    ctx: &OutputContext,
) -> Result<()> {
    let value = parse_hex_bytes(value)?;
    let mut module = conn.module(address);
    conn.control
        .write_data_by_identifier(&mut module, did, &value)
        .await
        .with_context(|| format!("Writing DID 0x{:04X} on {} failed", did, module))?;
    ctx.success(&format!("Wrote {} byte(s) to DID 0x{:04X}", value.len(), did));
    Ok(())
}

/// I/O control inside an extended session held open by the keepalive
pub async fn actuate(
    conn: &Connection,
    address: u32,
    actuator: &str,
    control_parameter: u8,
    state: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let actuator = catalog(conn)?
        .actuator(actuator)
        .ok_or_else(|| anyhow!("Unknown actuator '{}' (use a configured id or a hex DID)", actuator))?;
    let state = state.map(parse_hex_bytes).transpose()?.unwrap_or_default();

    let mut module = conn.module(address);
    conn.control
        .start_session(&mut module)
        .await
        .with_context(|| format!("Extended session on {} failed", module))?;

    let result = conn
        .control
        .execute_io_control(&mut module, &actuator, control_parameter, &state)
        .await;
    // Always hand the module back to the default session
    if let Err(e) = conn.control.end_session(&mut module).await {
        ctx.warn(&format!("Returning {} to the default session failed: {}", module, e));
    }

    let response = result.with_context(|| format!("I/O control of {} failed", actuator.name))?;
    ctx.print(&[ControlRow::from(&response)]);
    Ok(())
}

pub async fn routine(
    conn: &Connection,
    address: u32,
    routine: &str,
    control_type: u8,
    option_record: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let routine = catalog(conn)?
        .routine(routine)
        .ok_or_else(|| anyhow!("Unknown routine '{}' (use a configured id or a hex RID)", routine))?;
    let option_record = option_record
        .map(parse_hex_bytes)
        .transpose()?
        .unwrap_or_default();

    let mut module = conn.module(address);
    let response = conn
        .control
        .execute_routine(&mut module, &routine, control_type, &option_record)
        .await
        .with_context(|| format!("Routine {} failed", routine.name))?;
    ctx.print(&[ControlRow::from(&response)]);
    Ok(())
}
