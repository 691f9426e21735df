use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::io::Write;

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// Rebuild the derived index from the record files.
    Rebuild,
    /// Report whether the index exists and matches the records.
    Status,
}

#[derive(Debug, Serialize)]
struct RebuildOutput {
    items: usize,
    skipped: usize,
    recreated: bool,
    elapsed_ms: u128,
    warnings: Vec<WarningView>,
}

pub fn run_index(command: &IndexCommand, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    match command {
        IndexCommand::Rebuild => {
            let report = store.rebuild_index()?;
            let payload = RebuildOutput {
                items: report.item_count,
                skipped: report.skipped,
                recreated: report.recreated,
                elapsed_ms: report.elapsed.as_millis(),
                warnings: warning_views(&report.warnings),
            };
            render_warnings(ctx.output, &payload.warnings)?;
            render(ctx.output, &payload, |o, w| {
                if o.recreated {
                    writeln!(w, "Corrupt index discarded")?;
                }
                writeln!(
                    w,
                    "Indexed {} item(s), skipped {} file(s) in {} ms",
                    o.items, o.skipped, o.elapsed_ms
                )
            })
        }
        IndexCommand::Status => {
            let status = store.query().status()?;
            render(ctx.output, &status, |s, w| {
                let state = match (s.exists, s.fresh) {
                    (false, _) => "missing",
                    (true, true) => "fresh",
                    (true, false) => "stale",
                };
                writeln!(
                    w,
                    "index {state} (enabled: {}, items: {})",
                    s.enabled,
                    s.items.map_or_else(|| "-".to_string(), |n| n.to_string())
                )?;
                if let Some(reason) = &s.reason {
                    writeln!(w, "  {reason}")?;
                }
                Ok(())
            })
        }
    }
}
