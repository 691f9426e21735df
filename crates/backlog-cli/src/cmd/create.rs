use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::Result;
use backlog_core::{CreateOptions, Kind};
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Item title (single line).
    #[arg(long, short = 't')]
    pub title: String,

    /// epic, feature, userstory, task or bug.
    #[arg(long, short = 'k', default_value = "task")]
    pub kind: Kind,

    /// Parent item ID.
    #[arg(long)]
    pub parent: Option<String>,

    /// Priority label, e.g. P1.
    #[arg(long)]
    pub priority: Option<String>,

    #[arg(long)]
    pub area: Option<String>,

    #[arg(long)]
    pub iteration: Option<String>,

    /// Tag to attach (repeatable).
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateOutput {
    id: String,
    kind: Kind,
    title: String,
    state: String,
    parent: Option<String>,
    path: String,
    warnings: Vec<WarningView>,
}

pub fn run_create(args: &CreateArgs, ctx: &Context) -> Result<()> {
    let agent = ctx.agent()?;
    let store = ctx.open_store()?;

    let options = CreateOptions {
        parent: args.parent.clone(),
        priority: args.priority.clone(),
        area: args.area.clone(),
        iteration: args.iteration.clone(),
        tags: args.tags.clone(),
        owner: None,
    };
    let created = store.create(args.kind, &args.title, &agent, options)?;
    let item = created.value;
    let path = store.locate(&item.id)?;

    let payload = CreateOutput {
        id: item.id,
        kind: item.kind,
        title: item.title,
        state: item.state,
        parent: item.parent,
        path: path.display().to_string(),
        warnings: warning_views(&created.warnings),
    };
    render_warnings(ctx.output, &payload.warnings)?;
    render(ctx.output, &payload, |o, w| {
        writeln!(w, "{}  {} [{}] {}", o.id, o.kind, o.state, o.title)
    })
}
