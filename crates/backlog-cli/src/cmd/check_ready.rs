use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::Result;
use backlog_core::workflow::ParentReadiness;
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct CheckReadyArgs {
    /// Item ID.
    pub id: String,

    /// Skip the parent story's own gate.
    #[arg(long)]
    pub no_parent: bool,
}

#[derive(Debug, Serialize)]
struct CheckReadyOutput {
    id: String,
    ready: bool,
    missing: Vec<String>,
    parent: Option<ParentReadiness>,
    warnings: Vec<WarningView>,
}

/// Report Ready-gate gaps. Exits non-zero when anything is missing.
pub fn run_check_ready(args: &CheckReadyArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let report = store.check_ready(&args.id, !args.no_parent)?;

    let payload = CheckReadyOutput {
        ready: report.is_ready(),
        warnings: warning_views(&report.warnings),
        id: report.item_id,
        missing: report.missing,
        parent: report.parent,
    };
    render_warnings(ctx.output, &payload.warnings)?;
    render(ctx.output, &payload, |o, w| {
        if o.ready {
            return writeln!(w, "{} is ready", o.id);
        }
        if !o.missing.is_empty() {
            writeln!(w, "{} missing: {}", o.id, o.missing.join(", "))?;
        }
        if let Some(parent) = o.parent.as_ref().filter(|p| !p.missing.is_empty()) {
            writeln!(w, "parent {} missing: {}", parent.id, parent.missing.join(", "))?;
        }
        Ok(())
    })?;

    if !payload.ready {
        anyhow::bail!("{} is not ready", payload.id);
    }
    Ok(())
}
