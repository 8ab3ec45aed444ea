//! Read command - ReadDataByIdentifier

use anyhow::{Context, Result};
use serde_json::json;

use crate::connection::Connection;
use crate::output::{ascii, hex_bytes, OutputContext};

pub async fn read(conn: &Connection, address: u32, did: u16, ctx: &OutputContext) -> Result<()> {
    let module = conn.module(address);
    let value = conn
        .control
        .read_data_by_identifier(&module, did)
        .await
        .with_context(|| format!("Reading DID 0x{:04X} from {} failed", did, module))?;

    ctx.print_kv(
        &json!({
            "address": address,
            "did": format!("0x{:04X}", did),
            "value": hex::encode_upper(&value),
        }),
        &[
            ("DID", format!("0x{:04X}", did)),
            ("Hex", hex_bytes(&value)),
            ("ASCII", ascii(&value)),
        ],
    );
    Ok(())
}
