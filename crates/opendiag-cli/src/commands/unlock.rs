//! Unlock command - security access

use anyhow::{bail, Context, Result};
use serde_json::json;

use opendiag_core::KeyOptions;

use crate::connection::{parse_hex_bytes, Connection};
use crate::output::{hex_bytes, OutputContext};

/// Extended session, then the seed-key handshake at `level`
pub async fn unlock(
    conn: &Connection,
    address: u32,
    level: u8,
    key: Option<&str>,
    algorithm: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    if level % 2 == 0 {
        bail!("Security level must be odd (the requestSeed sub-function), got {}", level);
    }
    let options = match (key, algorithm) {
        (Some(key), _) => KeyOptions::manual(parse_hex_bytes(key)?),
        (None, Some(id)) => KeyOptions::registered(id),
        (None, None) => KeyOptions::default(),
    };

    let mut module = conn.module(address);
    conn.security
        .switch_to_extended_session(&mut module)
        .await
        .with_context(|| format!("Extended session on {} failed", module))?;

    ctx.info(&format!("Requesting seed for level 0x{:02X}...", level));
    let outcome = conn
        .security
        .request_security_access(&mut module, level, options)
        .await
        .with_context(|| format!("Security access on {} failed", module))?;

    ctx.print_kv(
        &json!({
            "address": outcome.address,
            "level": outcome.level,
            "seed": hex::encode_upper(&outcome.seed),
            "key": hex::encode_upper(&outcome.key),
            "message": outcome.message,
        }),
        &[
            ("Seed", hex_bytes(&outcome.seed)),
            ("Key", hex_bytes(&outcome.key)),
        ],
    );
    ctx.success(&outcome.message);
    Ok(())
}
