use crate::cmd::Context;
use crate::output::{pretty_kv, pretty_rule, pretty_section, render_split};
use anyhow::Result;
use backlog_core::WorkItem;
use backlog_core::codec::format_timestamp;
use clap::Args;
use std::io::{self, Write};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Item ID.
    pub id: String,

    /// Print only the last N worklog entries.
    #[arg(long, value_name = "N")]
    pub tail: Option<usize>,
}

fn worklog_tail(item: &WorkItem, tail: Option<usize>) -> usize {
    tail.map_or(0, |n| item.worklog.len().saturating_sub(n))
}

fn render_text(item: &WorkItem, skip: usize, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{}\t{}\t{}\t{}", item.id, item.kind, item.state, item.title)?;
    for entry in &item.worklog[skip..] {
        writeln!(
            w,
            "{}\t{}\t{}",
            format_timestamp(entry.timestamp),
            entry.agent,
            entry.message
        )?;
    }
    Ok(())
}

fn render_pretty(item: &WorkItem, skip: usize, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("{}  {}", item.id, item.title))?;
    pretty_kv(w, "Kind", item.kind.as_str())?;
    pretty_kv(w, "State", &item.state)?;
    pretty_kv(w, "Owner", item.owner.as_deref().unwrap_or("-"))?;
    pretty_kv(w, "Parent", item.parent.as_deref().unwrap_or("-"))?;
    pretty_kv(w, "Priority", &item.priority)?;
    pretty_kv(w, "Area", &item.area)?;
    if !item.tags.is_empty() {
        pretty_kv(w, "Tags", item.tags.join(", "))?;
    }
    for (name, targets) in item.links.iter().filter(|(_, t)| !t.is_empty()) {
        pretty_kv(w, name, targets.join(", "))?;
    }

    for (name, text) in &item.sections {
        if text.trim().is_empty() {
            continue;
        }
        writeln!(w)?;
        pretty_section(w, name)?;
        writeln!(w, "{}", text.trim_end())?;
    }

    writeln!(w)?;
    pretty_section(w, "Worklog")?;
    for entry in &item.worklog[skip..] {
        writeln!(
            w,
            "{}  [{}]  {}",
            format_timestamp(entry.timestamp),
            entry.agent,
            entry.message
        )?;
    }
    pretty_rule(w)
}

pub fn run_show(args: &ShowArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let mut item = store.get(&args.id)?;
    let skip = worklog_tail(&item, args.tail);
    if ctx.output.is_json() && skip > 0 {
        item.worklog.drain(..skip);
    }

    render_split(
        ctx.output,
        &item,
        |item, w| render_text(item, skip, w),
        |item, w| render_pretty(item, skip, w),
    )
}
