use crate::cmd::Context;
use crate::output::{WarningView, render_split, render_warnings, warning_views};
use anyhow::Result;
use backlog_core::{DerivedIndexRow, ItemFilter, Kind, SourceKind};
use clap::Args;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, short = 'k')]
    pub kind: Option<Kind>,

    #[arg(long, short = 's')]
    pub state: Option<String>,

    #[arg(long)]
    pub owner: Option<String>,

    #[arg(long)]
    pub parent: Option<String>,

    #[arg(long)]
    pub tag: Option<String>,

    /// Case-insensitive substring of the title.
    #[arg(long)]
    pub title: Option<String>,

    /// Include items in terminal states.
    #[arg(long, short = 'a')]
    pub all: bool,

    #[arg(long)]
    pub limit: Option<usize>,
}

impl ListArgs {
    fn filter(&self) -> ItemFilter {
        ItemFilter {
            kind: self.kind,
            state: self.state.clone(),
            owner: self.owner.clone(),
            parent: self.parent.clone(),
            tag: self.tag.clone(),
            title_contains: self.title.clone(),
            include_terminal: self.all || self.state.is_some(),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListOutput {
    source: SourceKind,
    count: usize,
    items: Vec<DerivedIndexRow>,
    warnings: Vec<WarningView>,
}

fn render_text(o: &ListOutput, w: &mut dyn Write) -> io::Result<()> {
    for row in &o.items {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}",
            row.id,
            row.kind,
            row.state,
            row.owner.as_deref().unwrap_or("-"),
            row.title
        )?;
    }
    Ok(())
}

fn render_pretty(o: &ListOutput, w: &mut dyn Write) -> io::Result<()> {
    if o.items.is_empty() {
        return writeln!(w, "No items.");
    }
    writeln!(
        w,
        "{:<14}  {:<10}  {:<11}  {:<10}  TITLE",
        "ID", "KIND", "STATE", "OWNER"
    )?;
    writeln!(w, "{:-<88}", "")?;
    for row in &o.items {
        writeln!(
            w,
            "{:<14}  {:<10}  {:<11}  {:<10}  {}",
            row.id,
            row.kind.as_str(),
            row.state,
            row.owner.as_deref().unwrap_or("-"),
            row.title
        )?;
    }
    writeln!(w, "{} item(s) from {}", o.count, o.source.as_str())
}

pub fn run_list(args: &ListArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let query = store.query();
    let outcome = query.list(&args.filter())?;
    // A background refresh must finish before the process exits.
    if let Some(Err(e)) = query.wait_for_refresh() {
        tracing::warn!(error = %e, "background index refresh failed");
    }

    let payload = ListOutput {
        source: outcome.source,
        count: outcome.rows.len(),
        items: outcome.rows,
        warnings: warning_views(&outcome.warnings),
    };
    render_warnings(ctx.output, &payload.warnings)?;
    render_split(ctx.output, &payload, render_text, render_pretty)
}
