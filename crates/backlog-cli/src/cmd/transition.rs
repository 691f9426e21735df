//! `bkl transition`: move an item to another workflow state.
//!
//! Entering an active state takes ownership for the agent; leaving it
//! releases the agent's marker. Parents are moved forward afterwards unless
//! `--no-sync` is given.

use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::Result;
use backlog_core::{SyncMove, TransitionOptions};
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct TransitionArgs {
    /// Item ID.
    pub id: String,

    /// Target state, e.g. Ready or InProgress.
    pub state: String,

    /// Text appended to the worklog entry.
    #[arg(long, short = 'n')]
    pub note: Option<String>,

    /// Allow moving below the state the item's children imply.
    #[arg(long)]
    pub force: bool,

    /// Do not propagate the change to ancestors.
    #[arg(long)]
    pub no_sync: bool,
}

#[derive(Debug, Serialize)]
struct TransitionOutput {
    id: String,
    previous_state: String,
    new_state: String,
    changed: bool,
    owner: Option<String>,
    lock_acquired: bool,
    lock_released: bool,
    parent_moves: Vec<SyncMove>,
    warnings: Vec<WarningView>,
}

pub fn run_transition(args: &TransitionArgs, ctx: &Context) -> Result<()> {
    let agent = ctx.agent()?;
    let store = ctx.open_store()?;

    let options = TransitionOptions {
        sync_parent: !args.no_sync,
        force: args.force,
        note: args.note.clone(),
    };
    let outcome = store.transition(&args.id, &args.state, &agent, &options)?;

    let mut warnings = warning_views(&outcome.warnings);
    let mut parent_moves = Vec::new();
    if let Some(sync) = outcome.sync {
        warnings.extend(warning_views(&sync.warnings));
        parent_moves = sync.moves;
    }

    let payload = TransitionOutput {
        id: outcome.item.id,
        previous_state: outcome.from,
        new_state: outcome.item.state,
        changed: outcome.changed,
        owner: outcome.item.owner,
        lock_acquired: outcome.lock_acquired,
        lock_released: outcome.lock_released,
        parent_moves,
        warnings,
    };
    render_warnings(ctx.output, &payload.warnings)?;
    render(ctx.output, &payload, |o, w| {
        if !o.changed {
            return writeln!(w, "{} already {}", o.id, o.new_state);
        }
        writeln!(w, "{}  {} -> {}", o.id, o.previous_state, o.new_state)?;
        if o.lock_acquired {
            writeln!(w, "  ownership taken")?;
        }
        if o.lock_released {
            writeln!(w, "  ownership released")?;
        }
        for m in &o.parent_moves {
            writeln!(w, "  parent {}  {} -> {}", m.item_id, m.from, m.to)?;
        }
        Ok(())
    })
}
