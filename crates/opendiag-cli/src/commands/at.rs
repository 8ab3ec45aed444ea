//! AT command passthrough

use std::time::Duration;

use anyhow::{Context, Result};

use crate::connection::Connection;
use crate::output::OutputContext;

const AT_TIMEOUT: Duration = Duration::from_secs(5);

/// Send a raw adapter command and print the answer
pub async fn at(conn: &Connection, command: &str, ctx: &OutputContext) -> Result<()> {
    let answer = conn
        .transport
        .send_text(command, AT_TIMEOUT)
        .await
        .with_context(|| format!("'{}' failed", command))?;
    ctx.print_kv(
        &serde_json::json!({ "command": command, "answer": answer }),
        &[("Answer", answer.clone())],
    );
    Ok(())
}
