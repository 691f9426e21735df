use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::Result;
use backlog_core::codec::format_timestamp;
use backlog_core::guard::LockStatus;
use clap::Subcommand;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show the ownership marker of one item.
    Inspect {
        /// Item ID.
        id: String,
    },
    /// Show every ownership marker in the product.
    List,
    /// Remove an item's ownership marker, whoever holds it.
    Break {
        /// Item ID.
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct LockOutput {
    id: String,
    lock: Option<LockStatus>,
}

#[derive(Debug, Serialize)]
struct BreakOutput {
    id: String,
    broken: Option<LockStatus>,
    warnings: Vec<WarningView>,
}

fn describe(status: &LockStatus, w: &mut dyn Write) -> io::Result<()> {
    match status {
        LockStatus::Held(info) => writeln!(
            w,
            "{}  held by {} since {} (pid {})",
            info.item_id,
            info.agent,
            format_timestamp(info.acquired_at),
            info.pid
        ),
        LockStatus::Unreadable {
            item_id, reason, ..
        } => writeln!(w, "{item_id}  unreadable marker: {reason}"),
    }
}

pub fn run_lock(command: &LockCommand, ctx: &Context) -> Result<()> {
    match command {
        LockCommand::Inspect { id } => {
            let store = ctx.open_store()?;
            let payload = LockOutput {
                lock: store.inspect_lock(id)?,
                id: id.clone(),
            };
            render(ctx.output, &payload, |o, w| match &o.lock {
                Some(status) => describe(status, w),
                None => writeln!(w, "{}  not locked", o.id),
            })
        }
        LockCommand::List => {
            let store = ctx.open_store()?;
            let locks = store.list_locks()?;
            render(ctx.output, &locks, |locks, w| {
                if locks.is_empty() {
                    return writeln!(w, "No ownership locks.");
                }
                locks.iter().try_for_each(|status| describe(status, w))
            })
        }
        LockCommand::Break { id } => {
            let agent = ctx.agent()?;
            let store = ctx.open_store()?;
            let written = store.break_lock(id, &agent)?;
            let payload = BreakOutput {
                id: id.clone(),
                warnings: warning_views(&written.warnings),
                broken: written.value,
            };
            render_warnings(ctx.output, &payload.warnings)?;
            render(ctx.output, &payload, |o, w| match &o.broken {
                Some(status) => {
                    write!(w, "broke: ")?;
                    describe(status, w)
                }
                None => writeln!(w, "{}  not locked", o.id),
            })
        }
    }
}
