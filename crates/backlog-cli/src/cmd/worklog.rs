use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::Result;
use backlog_core::codec::format_timestamp;
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct WorklogArgs {
    /// Item ID.
    pub id: String,

    /// Entry text (single line).
    pub message: String,
}

#[derive(Debug, Serialize)]
struct WorklogOutput {
    id: String,
    timestamp: String,
    agent: String,
    message: String,
    warnings: Vec<WarningView>,
}

/// Append a free-text entry; allowed in every state, terminal included.
pub fn run_worklog(args: &WorklogArgs, ctx: &Context) -> Result<()> {
    let agent = ctx.agent()?;
    let store = ctx.open_store()?;
    let written = store.append_worklog(&args.id, &agent, &args.message)?;
    let entry = written.value;

    let payload = WorklogOutput {
        id: args.id.clone(),
        timestamp: format_timestamp(entry.timestamp),
        agent: entry.agent,
        message: entry.message,
        warnings: warning_views(&written.warnings),
    };
    render_warnings(ctx.output, &payload.warnings)?;
    render(ctx.output, &payload, |o, w| {
        writeln!(w, "{}  {}  [{}]  {}", o.id, o.timestamp, o.agent, o.message)
    })
}
