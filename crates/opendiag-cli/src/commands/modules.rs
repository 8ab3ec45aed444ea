//! Modules command - ECU discovery with DTC summary

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use opendiag_core::ModuleScanner;

use crate::connection::Connection;
use crate::output::{ModuleRow, OutputContext, OutputFormat};

/// Probe the module catalog and list every responder
pub async fn modules(conn: &Connection, ctx: &OutputContext) -> Result<()> {
    let scanner = ModuleScanner::new(
        conn.transport.clone(),
        &conn.config.scanner,
        &conn.config.session,
    )
    .context("Invalid scanner configuration")?;

    let bar = if ctx.format == OutputFormat::Table && !ctx.quiet {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
                .progress_chars("=> "),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut progress = scanner.subscribe_progress();
    let follower = tokio::spawn({
        let bar = bar.clone();
        async move {
            while progress.changed().await.is_ok() {
                let update = progress.borrow_and_update().clone();
                bar.set_position((update.fraction * 100.0).round() as u64);
                bar.set_message(update.status);
            }
        }
    });

    // Ctrl+C stops the scan after the current probe
    let cancel = scanner.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = scanner.scan().await;
    interrupt.abort();
    follower.abort();
    bar.finish_and_clear();

    let report = result.context("Module scan failed")?;
    if report.cancelled {
        ctx.warn(&format!(
            "Scan cancelled after {} of {} addresses",
            report.probed,
            scanner.catalog().len()
        ));
    }

    let rows: Vec<ModuleRow> = report.modules.iter().map(ModuleRow::from).collect();
    ctx.print(&rows);
    ctx.success(&format!(
        "{} module(s) responded, {} DTC(s) stored",
        report.modules.len(),
        report.modules.iter().map(|m| m.dtc_count).sum::<usize>()
    ));
    Ok(())
}
